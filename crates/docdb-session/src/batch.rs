//! Batch commands and the batch wire format.
//!
//! Writes reach the server as one `POST /bulk_docs` whose body is
//! `{"Commands": [...]}`; the reply is `{"Results": [...]}` with one result
//! per command, in submission order.

use docdb_core::normalize_id;
use serde_json::{Map, Value, json};

/// Kind of a batch command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    Put,
    Delete,
    Patch,
}

impl CommandType {
    /// Wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            CommandType::Put => "PUT",
            CommandType::Delete => "DELETE",
            CommandType::Patch => "PATCH",
        }
    }
}

/// A server-side patch script.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchRequest {
    pub script: String,
    pub values: Map<String, Value>,
}

impl PatchRequest {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            values: Map::new(),
        }
    }

    /// Bind a script argument (`args.name`).
    #[must_use]
    pub fn with_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.values.insert(name.into(), value);
        self
    }
}

/// One command in a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandData {
    Put {
        id: String,
        change_vector: Option<String>,
        /// Full document, `@metadata` included.
        document: Map<String, Value>,
    },
    Delete {
        id: String,
        change_vector: Option<String>,
    },
    Patch {
        id: String,
        change_vector: Option<String>,
        patch: PatchRequest,
    },
}

impl CommandData {
    pub fn put(id: impl Into<String>, document: Map<String, Value>) -> Self {
        CommandData::Put {
            id: id.into(),
            change_vector: None,
            document,
        }
    }

    pub fn delete(id: impl Into<String>) -> Self {
        CommandData::Delete {
            id: id.into(),
            change_vector: None,
        }
    }

    pub fn patch(id: impl Into<String>, patch: PatchRequest) -> Self {
        CommandData::Patch {
            id: id.into(),
            change_vector: None,
            patch,
        }
    }

    /// Require the document to be at `change_vector`.
    #[must_use]
    pub fn with_change_vector(mut self, cv: impl Into<String>) -> Self {
        let cv = Some(cv.into());
        match &mut self {
            CommandData::Put { change_vector, .. }
            | CommandData::Delete { change_vector, .. }
            | CommandData::Patch { change_vector, .. } => *change_vector = cv,
        }
        self
    }

    pub fn id(&self) -> &str {
        match self {
            CommandData::Put { id, .. }
            | CommandData::Delete { id, .. }
            | CommandData::Patch { id, .. } => id,
        }
    }

    pub fn change_vector(&self) -> Option<&str> {
        match self {
            CommandData::Put { change_vector, .. }
            | CommandData::Delete { change_vector, .. }
            | CommandData::Patch { change_vector, .. } => change_vector.as_deref(),
        }
    }

    pub fn command_type(&self) -> CommandType {
        match self {
            CommandData::Put { .. } => CommandType::Put,
            CommandData::Delete { .. } => CommandType::Delete,
            CommandData::Patch { .. } => CommandType::Patch,
        }
    }

    /// `(type, normalized id)` used to detect conflicting deferred commands.
    pub fn dedup_key(&self) -> (CommandType, String) {
        (self.command_type(), normalize_id(self.id()))
    }

    /// Wire representation.
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        out.insert("Type".into(), json!(self.command_type().as_str()));
        out.insert("Id".into(), json!(self.id()));
        if let Some(cv) = self.change_vector() {
            out.insert("ChangeVector".into(), json!(cv));
        }
        match self {
            CommandData::Put { document, .. } => {
                out.insert("Document".into(), Value::Object(document.clone()));
            }
            CommandData::Delete { .. } => {}
            CommandData::Patch { patch, .. } => {
                out.insert(
                    "Patch".into(),
                    json!({ "Script": patch.script, "Values": patch.values }),
                );
            }
        }
        Value::Object(out)
    }
}

/// An ordered list of commands to send in one request.
#[derive(Debug, Clone, Default)]
pub struct BatchPlan {
    pub commands: Vec<CommandData>,
}

impl BatchPlan {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: CommandData) {
        self.commands.push(command);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Number of commands of each type: `(puts, deletes, patches)`.
    pub fn counts(&self) -> (usize, usize, usize) {
        self.commands
            .iter()
            .fold((0, 0, 0), |(p, d, x), c| match c.command_type() {
                CommandType::Put => (p + 1, d, x),
                CommandType::Delete => (p, d + 1, x),
                CommandType::Patch => (p, d, x + 1),
            })
    }

    /// `{"Commands": [...]}`.
    pub fn to_request_body(&self) -> Value {
        json!({
            "Commands": self.commands.iter().map(CommandData::to_json).collect::<Vec<_>>()
        })
    }
}
