//! Query tokens.
//!
//! Every builder call appends one or more tokens to a section of the query.
//! Each token knows how to write its own text fragment; the builder only
//! decides section order and separators.

use docdb_core::{QueryOperator, escape_field_if_necessary, escape_include};
use std::fmt::Write;

/// Comparison performed by a [`WhereToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WhereOperator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    In,
    AllIn,
    Between,
    Search,
    Lucene,
    StartsWith,
    EndsWith,
    Exists,
    Regex,
    Spatial(SpatialRelation),
}

impl WhereOperator {
    /// Binary comparison symbol, for operators rendered as `Field <op> $p`.
    const fn symbol(self) -> Option<&'static str> {
        match self {
            WhereOperator::Equals => Some("="),
            WhereOperator::NotEquals => Some("!="),
            WhereOperator::GreaterThan => Some(">"),
            WhereOperator::GreaterThanOrEqual => Some(">="),
            WhereOperator::LessThan => Some("<"),
            WhereOperator::LessThanOrEqual => Some("<="),
            _ => None,
        }
    }

    /// Function name, for operators rendered as `fn(Field, $p)`.
    const fn function(self) -> Option<&'static str> {
        match self {
            WhereOperator::Search => Some("search"),
            WhereOperator::Lucene => Some("lucene"),
            WhereOperator::StartsWith => Some("startsWith"),
            WhereOperator::EndsWith => Some("endsWith"),
            WhereOperator::Exists => Some("exists"),
            WhereOperator::Regex => Some("regex"),
            _ => None,
        }
    }
}

/// How a spatial field relates to the query shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpatialRelation {
    Within,
    Contains,
    Disjoint,
    Intersects,
}

impl SpatialRelation {
    const fn function(self) -> &'static str {
        match self {
            SpatialRelation::Within => "spatial.within",
            SpatialRelation::Contains => "spatial.contains",
            SpatialRelation::Disjoint => "spatial.disjoint",
            SpatialRelation::Intersects => "spatial.intersects",
        }
    }
}

/// Distance units of a circle radius.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpatialUnits {
    Kilometers,
    Miles,
}

impl SpatialUnits {
    pub const fn as_str(self) -> &'static str {
        match self {
            SpatialUnits::Kilometers => "Kilometers",
            SpatialUnits::Miles => "Miles",
        }
    }
}

/// Shape argument of a spatial predicate. Holds parameter names.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeToken {
    Circle {
        radius: String,
        latitude: String,
        longitude: String,
        units: Option<SpatialUnits>,
    },
    Wkt {
        shape: String,
        units: Option<SpatialUnits>,
    },
}

impl ShapeToken {
    pub fn write_to(&self, out: &mut String) {
        let units = match self {
            ShapeToken::Circle {
                radius,
                latitude,
                longitude,
                units,
            } => {
                let _ = write!(out, "spatial.circle(${radius}, ${latitude}, ${longitude}");
                units
            }
            ShapeToken::Wkt { shape, units } => {
                let _ = write!(out, "spatial.wkt(${shape}");
                units
            }
        };
        if let Some(units) = units {
            let _ = write!(out, ", '{}'", units.as_str());
        }
        out.push(')');
    }
}

/// Modifiers attached to a single predicate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WhereOptions {
    pub exact: bool,
    /// Set only for `search`; records how terms are combined.
    pub search_operator: Option<QueryOperator>,
    pub boost: Option<f64>,
    pub fuzzy: Option<f64>,
    pub proximity: Option<u32>,
}

/// A single predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct WhereToken {
    pub field: String,
    pub operator: WhereOperator,
    /// Parameter name, or the `from` parameter of a `between`.
    pub parameter: Option<String>,
    /// The `to` parameter of a `between`.
    pub to_parameter: Option<String>,
    /// Query shape of a spatial predicate.
    pub shape: Option<ShapeToken>,
    pub options: WhereOptions,
}

impl WhereToken {
    pub fn new(field: impl Into<String>, operator: WhereOperator, parameter: Option<String>) -> Self {
        Self {
            field: field.into(),
            operator,
            parameter,
            to_parameter: None,
            shape: None,
            options: WhereOptions::default(),
        }
    }

    pub fn write_to(&self, out: &mut String) {
        let options = &self.options;
        if options.boost.is_some() {
            out.push_str("boost(");
        }
        if options.fuzzy.is_some() {
            out.push_str("fuzzy(");
        }
        if options.proximity.is_some() {
            out.push_str("proximity(");
        }
        if options.exact {
            out.push_str("exact(");
        }

        self.write_inner(out);

        if options.exact {
            out.push(')');
        }
        if let Some(proximity) = options.proximity {
            let _ = write!(out, ", {proximity})");
        }
        if let Some(fuzzy) = options.fuzzy {
            let _ = write!(out, ", {fuzzy})");
        }
        if let Some(boost) = options.boost {
            let _ = write!(out, ", {boost})");
        }
    }

    fn write_inner(&self, out: &mut String) {
        let field = escape_field_if_necessary(&self.field);
        let param = self.parameter.as_deref().unwrap_or_default();

        if let Some(symbol) = self.operator.symbol() {
            let _ = write!(out, "{field} {symbol} ${param}");
            return;
        }
        if let Some(function) = self.operator.function() {
            let _ = write!(out, "{function}({field}");
            match self.operator {
                WhereOperator::Exists => {}
                WhereOperator::Search => {
                    let _ = write!(out, ", ${param}");
                    if self.options.search_operator == Some(QueryOperator::And) {
                        out.push_str(", and");
                    }
                }
                _ => {
                    let _ = write!(out, ", ${param}");
                }
            }
            out.push(')');
            return;
        }
        match self.operator {
            WhereOperator::In => {
                let _ = write!(out, "{field} in (${param})");
            }
            WhereOperator::AllIn => {
                let _ = write!(out, "{field} all in (${param})");
            }
            WhereOperator::Between => {
                let to = self.to_parameter.as_deref().unwrap_or_default();
                let _ = write!(out, "{field} between ${param} and ${to}");
            }
            WhereOperator::Spatial(relation) => {
                let _ = write!(out, "{}({field}, ", relation.function());
                if let Some(shape) = &self.shape {
                    shape.write_to(out);
                }
                out.push(')');
            }
            _ => {}
        }
    }
}

/// A token in the `where` section.
#[derive(Debug, Clone, PartialEq)]
pub enum WhereClauseToken {
    Where(WhereToken),
    And,
    Or,
    Not,
    OpenSubclause,
    CloseSubclause,
    True,
}

impl WhereClauseToken {
    pub fn is_operator(&self) -> bool {
        matches!(self, WhereClauseToken::And | WhereClauseToken::Or)
    }

    pub fn write_to(&self, out: &mut String) {
        match self {
            WhereClauseToken::Where(token) => token.write_to(out),
            WhereClauseToken::And => out.push_str("and"),
            WhereClauseToken::Or => out.push_str("or"),
            WhereClauseToken::Not => out.push_str("not"),
            WhereClauseToken::OpenSubclause => out.push('('),
            WhereClauseToken::CloseSubclause => out.push(')'),
            WhereClauseToken::True => out.push_str("true"),
        }
    }
}

/// Write a where-token list with a single space between tokens, except
/// directly inside parentheses.
pub fn write_where_tokens(tokens: &[WhereClauseToken], out: &mut String) {
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 {
            let previous = &tokens[i - 1];
            let need_space = !matches!(previous, WhereClauseToken::OpenSubclause)
                && !matches!(token, WhereClauseToken::CloseSubclause);
            if need_space {
                out.push(' ');
            }
        }
        token.write_to(out);
    }
}

/// Source of the query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FromToken {
    Collection { name: String, alias: Option<String> },
    Index { name: String, alias: Option<String> },
}

impl FromToken {
    pub fn set_alias(&mut self, new_alias: String) {
        match self {
            FromToken::Collection { alias, .. } | FromToken::Index { alias, .. } => {
                *alias = Some(new_alias);
            }
        }
    }

    pub fn write_to(&self, out: &mut String) {
        let alias = match self {
            FromToken::Collection { name, alias } => {
                out.push_str("from ");
                if name.chars().any(|c| c.is_whitespace() || c == '\'' || c == '"') {
                    let _ = write!(out, "'{}'", name.replace('\'', "\\'"));
                } else {
                    out.push_str(name);
                }
                alias
            }
            FromToken::Index { name, alias } => {
                let _ = write!(out, "from index '{}'", name.replace('\'', "\\'"));
                alias
            }
        };
        if let Some(alias) = alias {
            let _ = write!(out, " as {alias}");
        }
    }
}

/// Sort type hint for `order by`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OrderingType {
    #[default]
    String,
    Long,
    Double,
    AlphaNumeric,
}

/// A token in the `order by` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderByToken {
    Field {
        field: String,
        descending: bool,
        ordering: OrderingType,
    },
    Score {
        descending: bool,
    },
    Random {
        seed: Option<String>,
    },
}

impl OrderByToken {
    pub fn write_to(&self, out: &mut String) {
        match self {
            OrderByToken::Field {
                field,
                descending,
                ordering,
            } => {
                out.push_str(&escape_field_if_necessary(field));
                match ordering {
                    OrderingType::String => {}
                    OrderingType::Long => out.push_str(" as long"),
                    OrderingType::Double => out.push_str(" as double"),
                    OrderingType::AlphaNumeric => out.push_str(" as alphaNumeric"),
                }
                if *descending {
                    out.push_str(" desc");
                }
            }
            OrderByToken::Score { descending } => {
                out.push_str("score()");
                if *descending {
                    out.push_str(" desc");
                }
            }
            OrderByToken::Random { seed } => match seed {
                Some(seed) => {
                    let _ = write!(out, "random('{}')", seed.replace('\'', "\\'"));
                }
                None => out.push_str("random()"),
            },
        }
    }
}

/// A token in the `select` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectToken {
    Distinct,
    Field {
        field: String,
        alias: Option<String>,
    },
    GroupByKey {
        field: Option<String>,
        alias: Option<String>,
    },
    GroupBySum {
        field: String,
        alias: Option<String>,
    },
    GroupByCount {
        alias: Option<String>,
    },
}

fn write_alias(out: &mut String, field: &str, alias: Option<&String>) {
    if let Some(alias) = alias {
        if alias != field {
            let _ = write!(out, " as {}", escape_field_if_necessary(alias));
        }
    }
}

impl SelectToken {
    pub fn write_to(&self, out: &mut String) {
        match self {
            SelectToken::Distinct => out.push_str("distinct"),
            SelectToken::Field { field, alias } => {
                out.push_str(&escape_field_if_necessary(field));
                write_alias(out, field, alias.as_ref());
            }
            SelectToken::GroupByKey { field, alias } => {
                let field = field.as_deref().unwrap_or("key()");
                out.push_str(&escape_field_if_necessary(field));
                write_alias(out, field, alias.as_ref());
            }
            SelectToken::GroupBySum { field, alias } => {
                let _ = write!(out, "sum({})", escape_field_if_necessary(field));
                if let Some(alias) = alias {
                    let _ = write!(out, " as {}", escape_field_if_necessary(alias));
                }
            }
            SelectToken::GroupByCount { alias } => {
                out.push_str("count()");
                if let Some(alias) = alias {
                    let _ = write!(out, " as {}", escape_field_if_necessary(alias));
                }
            }
        }
    }
}

/// Write the select list. A lone `distinct` selects everything.
pub fn write_select_tokens(tokens: &[SelectToken], out: &mut String) {
    if let [SelectToken::Distinct] = tokens {
        out.push_str("distinct *");
        return;
    }
    let mut first = true;
    for token in tokens {
        if matches!(token, SelectToken::Distinct) {
            out.push_str("distinct ");
            continue;
        }
        if !first {
            out.push_str(", ");
        }
        first = false;
        token.write_to(out);
    }
}

/// `load <path> as <alias>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadToken {
    pub path: String,
    pub alias: String,
}

impl LoadToken {
    pub fn write_to(&self, out: &mut String) {
        let _ = write!(out, "{} as {}", self.path, self.alias);
    }
}

/// `declare function <name>(<parameters>) { <body> }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclareToken {
    pub name: String,
    pub parameters: String,
    pub body: String,
}

impl DeclareToken {
    pub fn write_to(&self, out: &mut String) {
        let _ = write!(
            out,
            "declare function {}({}) {{\n{}\n}}",
            self.name, self.parameters, self.body
        );
    }
}

/// Write a `group by` field.
pub fn write_group_by_field(field: &str, out: &mut String) {
    out.push_str(&escape_field_if_necessary(field));
}

/// Write an `include` path.
pub fn write_include(path: &str, out: &mut String) {
    out.push_str(&escape_include(path));
}
