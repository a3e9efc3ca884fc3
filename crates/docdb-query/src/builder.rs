//! The query token builder.
//!
//! [`QueryBuilder`] accumulates tokens as its fluent methods are called and
//! renders them into query text with positional parameters. Literal values
//! are never inlined: each one is registered in the parameter table under a
//! generated `p0`, `p1`, ... name (or an explicit `$name`).
//!
//! Structural rules are checked when tokens are appended, and clause balance
//! is checked again at render time, so malformed queries never reach the
//! server.

use crate::index_query::IndexQuery;
use crate::tokens::{
    DeclareToken, FromToken, LoadToken, OrderByToken, OrderingType, SelectToken, ShapeToken,
    SpatialRelation, SpatialUnits, WhereClauseToken, WhereOperator, WhereToken,
    write_group_by_field, write_include, write_select_tokens, write_where_tokens,
};
use docdb_core::error::QueryBuilderErrorKind;
use docdb_core::{DocumentConventions, Error, QueryOperator, Result, is_valid_parameter_name};
use serde::Serialize;
use serde_json::{Map, Value};

/// A fluent, stateful query compiler.
///
/// # Example
///
/// ```
/// use docdb_core::DocumentConventions;
/// use docdb_query::QueryBuilder;
///
/// let mut query = QueryBuilder::from_collection(&DocumentConventions::default(), "Users");
/// query
///     .where_equals("Name", "Ann")?
///     .where_greater_than("Age", 30)?
///     .order_by_descending("Age")?;
///
/// assert_eq!(
///     query.to_query_string()?,
///     "from Users where Name = $p0 and Age > $p1 order by Age desc"
/// );
/// # Ok::<(), docdb_core::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    from: FromToken,
    declare_tokens: Vec<DeclareToken>,
    group_by_tokens: Vec<String>,
    where_tokens: Vec<WhereClauseToken>,
    order_by_tokens: Vec<OrderByToken>,
    load_tokens: Vec<LoadToken>,
    select_tokens: Vec<SelectToken>,
    includes: Vec<String>,
    parameters: Map<String, Value>,
    raw_query: Option<String>,
    default_operator: QueryOperator,
    identity_property: String,
    negate: bool,
    depth: usize,
    start: Option<usize>,
    page_size: Option<usize>,
    wait_for_non_stale_results: bool,
    no_tracking: bool,
    no_caching: bool,
    skip_duplicate_checking: bool,
}

impl QueryBuilder {
    fn new(conventions: &DocumentConventions, from: FromToken) -> Self {
        Self {
            from,
            declare_tokens: Vec::new(),
            group_by_tokens: Vec::new(),
            where_tokens: Vec::new(),
            order_by_tokens: Vec::new(),
            load_tokens: Vec::new(),
            select_tokens: Vec::new(),
            includes: Vec::new(),
            parameters: Map::new(),
            raw_query: None,
            default_operator: conventions.query_operator(),
            identity_property: conventions.identity_property_name().to_string(),
            negate: false,
            depth: 0,
            start: None,
            page_size: None,
            wait_for_non_stale_results: false,
            no_tracking: false,
            no_caching: false,
            skip_duplicate_checking: false,
        }
    }

    /// Query a collection.
    pub fn from_collection(conventions: &DocumentConventions, collection: impl Into<String>) -> Self {
        Self::new(
            conventions,
            FromToken::Collection {
                name: collection.into(),
                alias: None,
            },
        )
    }

    /// Query a named index.
    pub fn from_index(conventions: &DocumentConventions, index: impl Into<String>) -> Self {
        Self::new(
            conventions,
            FromToken::Index {
                name: index.into(),
                alias: None,
            },
        )
    }

    // ==================== Accessors ====================

    /// The collection queried, if not an index query.
    pub fn collection_name(&self) -> Option<&str> {
        match &self.from {
            FromToken::Collection { name, .. } => Some(name),
            FromToken::Index { .. } => None,
        }
    }

    /// The index queried, if any.
    pub fn index_name(&self) -> Option<&str> {
        match &self.from {
            FromToken::Index { name, .. } => Some(name),
            FromToken::Collection { .. } => None,
        }
    }

    /// The parameter table.
    pub fn parameters(&self) -> &Map<String, Value> {
        &self.parameters
    }

    pub fn is_raw(&self) -> bool {
        self.raw_query.is_some()
    }

    pub fn is_no_tracking(&self) -> bool {
        self.no_tracking
    }

    pub fn is_no_caching(&self) -> bool {
        self.no_caching
    }

    /// Whether the query projects fields instead of returning whole documents.
    pub fn is_projection(&self) -> bool {
        self.select_tokens
            .iter()
            .any(|t| !matches!(t, SelectToken::Distinct))
            || !self.group_by_tokens.is_empty()
    }

    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    // ==================== Source ====================

    /// Alias the source (`from Users as u`).
    pub fn alias(&mut self, alias: impl Into<String>) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        let alias = alias.into();
        if !is_valid_parameter_name(&alias) {
            return Err(Error::query_builder(
                QueryBuilderErrorKind::InvalidUsage,
                format!("Alias '{alias}' is not a valid identifier"),
            ));
        }
        self.from.set_alias(alias);
        Ok(self)
    }

    /// Replace the builder contents with pre-written query text.
    ///
    /// Only allowed on a fresh builder; every token-based method fails
    /// afterwards. Parameters may still be added with [`add_parameter`].
    ///
    /// [`add_parameter`]: QueryBuilder::add_parameter
    pub fn raw_query(&mut self, text: impl Into<String>) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        let touched = !self.where_tokens.is_empty()
            || !self.declare_tokens.is_empty()
            || !self.group_by_tokens.is_empty()
            || !self.order_by_tokens.is_empty()
            || !self.load_tokens.is_empty()
            || !self.select_tokens.is_empty()
            || !self.includes.is_empty();
        if touched {
            return Err(Error::query_builder(
                QueryBuilderErrorKind::RawQuery,
                "A raw query can only be set on a builder without clauses",
            ));
        }
        self.raw_query = Some(text.into());
        Ok(self)
    }

    /// Register an explicit `$name` parameter.
    pub fn add_parameter(&mut self, name: &str, value: impl Serialize) -> Result<&mut Self> {
        let name = name.strip_prefix('$').unwrap_or(name);
        if !is_valid_parameter_name(name) {
            return Err(Error::query_builder(
                QueryBuilderErrorKind::InvalidParameter,
                format!("'{name}' is not a valid parameter name"),
            ));
        }
        if self.parameters.contains_key(name) {
            return Err(Error::query_builder(
                QueryBuilderErrorKind::InvalidParameter,
                format!("The parameter '{name}' was already added"),
            ));
        }
        self.parameters
            .insert(name.to_string(), serde_json::to_value(value)?);
        Ok(self)
    }

    // ==================== Predicates ====================

    /// `Field = $p`.
    pub fn where_equals(&mut self, field: &str, value: impl Serialize) -> Result<&mut Self> {
        self.where_equals_with(field, value, false)
    }

    /// `Field = $p`, optionally wrapped in `exact(...)`.
    pub fn where_equals_with(
        &mut self,
        field: &str,
        value: impl Serialize,
        exact: bool,
    ) -> Result<&mut Self> {
        let mut token = self.binary(field, WhereOperator::Equals, value)?;
        token.options.exact = exact;
        self.push_where(field, token)
    }

    /// `Field != $p`.
    pub fn where_not_equals(&mut self, field: &str, value: impl Serialize) -> Result<&mut Self> {
        let token = self.binary(field, WhereOperator::NotEquals, value)?;
        self.push_where(field, token)
    }

    pub fn where_greater_than(&mut self, field: &str, value: impl Serialize) -> Result<&mut Self> {
        let token = self.binary(field, WhereOperator::GreaterThan, value)?;
        self.push_where(field, token)
    }

    pub fn where_greater_than_or_equal(
        &mut self,
        field: &str,
        value: impl Serialize,
    ) -> Result<&mut Self> {
        let token = self.binary(field, WhereOperator::GreaterThanOrEqual, value)?;
        self.push_where(field, token)
    }

    pub fn where_less_than(&mut self, field: &str, value: impl Serialize) -> Result<&mut Self> {
        let token = self.binary(field, WhereOperator::LessThan, value)?;
        self.push_where(field, token)
    }

    pub fn where_less_than_or_equal(
        &mut self,
        field: &str,
        value: impl Serialize,
    ) -> Result<&mut Self> {
        let token = self.binary(field, WhereOperator::LessThanOrEqual, value)?;
        self.push_where(field, token)
    }

    /// `Field in ($p)` where `$p` is an array.
    pub fn where_in<V: Serialize>(
        &mut self,
        field: &str,
        values: impl IntoIterator<Item = V>,
    ) -> Result<&mut Self> {
        let values = to_array(values)?;
        let token = self.binary(field, WhereOperator::In, values)?;
        self.push_where(field, token)
    }

    /// `Field all in ($p)`: every value must be present.
    pub fn contains_all<V: Serialize>(
        &mut self,
        field: &str,
        values: impl IntoIterator<Item = V>,
    ) -> Result<&mut Self> {
        let values = to_array(values)?;
        let token = self.binary(field, WhereOperator::AllIn, values)?;
        self.push_where(field, token)
    }

    /// `Field between $from and $to` (inclusive).
    pub fn where_between(
        &mut self,
        field: &str,
        from: impl Serialize,
        to: impl Serialize,
    ) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        let from = self.add_query_parameter(serde_json::to_value(from)?);
        let to = self.add_query_parameter(serde_json::to_value(to)?);
        let mut token = WhereToken::new(self.field_name(field), WhereOperator::Between, Some(from));
        token.to_parameter = Some(to);
        self.push_where(field, token)
    }

    pub fn where_starts_with(&mut self, field: &str, prefix: impl Serialize) -> Result<&mut Self> {
        let token = self.binary(field, WhereOperator::StartsWith, prefix)?;
        self.push_where(field, token)
    }

    pub fn where_ends_with(&mut self, field: &str, suffix: impl Serialize) -> Result<&mut Self> {
        let token = self.binary(field, WhereOperator::EndsWith, suffix)?;
        self.push_where(field, token)
    }

    /// `exists(Field)`.
    pub fn where_exists(&mut self, field: &str) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        let token = WhereToken::new(self.field_name(field), WhereOperator::Exists, None);
        self.push_where(field, token)
    }

    /// `regex(Field, $p)`.
    pub fn where_regex(&mut self, field: &str, pattern: &str) -> Result<&mut Self> {
        let token = self.binary(field, WhereOperator::Regex, pattern)?;
        self.push_where(field, token)
    }

    /// `lucene(Field, $p)` with a raw Lucene clause.
    pub fn where_lucene(&mut self, field: &str, clause: &str) -> Result<&mut Self> {
        let token = self.binary(field, WhereOperator::Lucene, clause)?;
        self.push_where(field, token)
    }

    /// `spatial.within(Field, spatial.circle(...))`: points within `radius`
    /// of a center.
    pub fn within_radius_of(
        &mut self,
        field: &str,
        radius: f64,
        latitude: f64,
        longitude: f64,
        units: Option<SpatialUnits>,
    ) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        let shape = ShapeToken::Circle {
            radius: self.add_query_parameter(serde_json::to_value(radius)?),
            latitude: self.add_query_parameter(serde_json::to_value(latitude)?),
            longitude: self.add_query_parameter(serde_json::to_value(longitude)?),
            units,
        };
        self.spatial(field, SpatialRelation::Within, shape)
    }

    /// Relate a spatial field to a WKT shape.
    pub fn relates_to_shape(
        &mut self,
        field: &str,
        wkt: &str,
        relation: SpatialRelation,
        units: Option<SpatialUnits>,
    ) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        let shape = ShapeToken::Wkt {
            shape: self.add_query_parameter(Value::String(wkt.to_string())),
            units,
        };
        self.spatial(field, relation, shape)
    }

    fn spatial(
        &mut self,
        field: &str,
        relation: SpatialRelation,
        shape: ShapeToken,
    ) -> Result<&mut Self> {
        let mut token = WhereToken::new(
            self.field_name(field),
            WhereOperator::Spatial(relation),
            None,
        );
        token.shape = Some(shape);
        self.push_where(field, token)
    }

    /// The literal `true` predicate.
    pub fn where_true(&mut self) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        self.append_operator_if_needed();
        self.negate_if_needed(None);
        self.where_tokens.push(WhereClauseToken::True);
        Ok(self)
    }

    /// Full-text `search(Field, $p)`; terms are combined with OR.
    pub fn search(&mut self, field: &str, terms: &str) -> Result<&mut Self> {
        self.search_with_operator(field, terms, QueryOperator::Or)
    }

    /// Full-text search with an explicit term operator.
    pub fn search_with_operator(
        &mut self,
        field: &str,
        terms: &str,
        operator: QueryOperator,
    ) -> Result<&mut Self> {
        let mut token = self.binary(field, WhereOperator::Search, terms)?;
        token.options.search_operator = Some(operator);
        self.push_where(field, token)
    }

    // ==================== Modifiers ====================

    /// Boost the preceding predicate. `1.0` leaves it unchanged.
    pub fn boost(&mut self, boost: f64) -> Result<&mut Self> {
        if !boost.is_finite() || boost < 0.0 {
            return Err(Error::query_builder(
                QueryBuilderErrorKind::InvalidModifierValue,
                "Boost factor must be a non-negative number",
            ));
        }
        let token = self.last_predicate_mut("boost")?;
        if (boost - 1.0).abs() > f64::EPSILON {
            token.options.boost = Some(boost);
        }
        Ok(self)
    }

    /// Fuzzy-match the preceding predicate; `fuzzy` must lie in `0..=1`.
    pub fn fuzzy(&mut self, fuzzy: f64) -> Result<&mut Self> {
        if !(0.0..=1.0).contains(&fuzzy) {
            return Err(Error::query_builder(
                QueryBuilderErrorKind::InvalidModifierValue,
                "Fuzzy distance must be between 0.0 and 1.0",
            ));
        }
        let token = self.last_predicate_mut("fuzzy")?;
        token.options.fuzzy = Some(fuzzy);
        Ok(self)
    }

    /// Require the preceding search terms to lie within `proximity` words.
    pub fn proximity(&mut self, proximity: u32) -> Result<&mut Self> {
        if proximity < 1 {
            return Err(Error::query_builder(
                QueryBuilderErrorKind::InvalidModifierValue,
                "Proximity distance must be a number greater than or equal to 1",
            ));
        }
        let token = self.last_predicate_mut("proximity")?;
        if token.operator != WhereOperator::Search {
            return Err(Error::query_builder(
                QueryBuilderErrorKind::MisplacedModifier,
                "Proximity can only be used right after a search clause",
            ));
        }
        token.options.proximity = Some(proximity);
        Ok(self)
    }

    // ==================== Structure ====================

    /// Open a parenthesized subclause.
    pub fn open_subclause(&mut self) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        self.append_operator_if_needed();
        self.negate_if_needed(None);
        self.where_tokens.push(WhereClauseToken::OpenSubclause);
        self.depth += 1;
        Ok(self)
    }

    /// Close the innermost open subclause.
    pub fn close_subclause(&mut self) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        if self.depth == 0 {
            return Err(Error::query_builder(
                QueryBuilderErrorKind::UnbalancedClause,
                "Cannot close a subclause that was never opened",
            ));
        }
        self.depth -= 1;
        self.where_tokens.push(WhereClauseToken::CloseSubclause);
        Ok(self)
    }

    /// Join the next predicate with `and`.
    pub fn and_also(&mut self) -> Result<&mut Self> {
        self.push_operator(WhereClauseToken::And)
    }

    /// Join the next predicate with `or`.
    pub fn or_else(&mut self) -> Result<&mut Self> {
        self.push_operator(WhereClauseToken::Or)
    }

    /// Negate the next predicate or subclause.
    pub fn negate_next(&mut self) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        self.negate = !self.negate;
        Ok(self)
    }

    /// Change the operator auto-inserted between predicates.
    pub fn using_default_operator(&mut self, operator: QueryOperator) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        if !self.where_tokens.is_empty() {
            return Err(Error::query_builder(
                QueryBuilderErrorKind::InvalidUsage,
                "Default operator can only be set before any where clause is added",
            ));
        }
        self.default_operator = operator;
        Ok(self)
    }

    // ==================== Ordering ====================

    pub fn order_by(&mut self, field: &str) -> Result<&mut Self> {
        self.order_by_with(field, OrderingType::String)
    }

    pub fn order_by_descending(&mut self, field: &str) -> Result<&mut Self> {
        self.order_by_descending_with(field, OrderingType::String)
    }

    /// Ascending order with a sort type hint.
    pub fn order_by_with(&mut self, field: &str, ordering: OrderingType) -> Result<&mut Self> {
        self.push_order_by(field, false, ordering)
    }

    /// Descending order with a sort type hint.
    pub fn order_by_descending_with(
        &mut self,
        field: &str,
        ordering: OrderingType,
    ) -> Result<&mut Self> {
        self.push_order_by(field, true, ordering)
    }

    pub fn order_by_score(&mut self) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        self.order_by_tokens
            .push(OrderByToken::Score { descending: false });
        Ok(self)
    }

    pub fn order_by_score_descending(&mut self) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        self.order_by_tokens
            .push(OrderByToken::Score { descending: true });
        Ok(self)
    }

    /// Random order, optionally seeded for repeatable paging.
    pub fn random_ordering(&mut self, seed: Option<&str>) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        self.order_by_tokens.push(OrderByToken::Random {
            seed: seed.map(str::to_string),
        });
        Ok(self)
    }

    // ==================== Projection ====================

    /// Project the given fields.
    pub fn select_fields(&mut self, fields: &[&str]) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        for field in fields {
            self.select_tokens.push(SelectToken::Field {
                field: self.field_name(field),
                alias: None,
            });
        }
        Ok(self)
    }

    /// Project a field under another name.
    pub fn select_fields_as(&mut self, field: &str, alias: &str) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        self.select_tokens.push(SelectToken::Field {
            field: self.field_name(field),
            alias: Some(alias.to_string()),
        });
        Ok(self)
    }

    /// Return distinct results.
    pub fn distinct(&mut self) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        if matches!(self.select_tokens.first(), Some(SelectToken::Distinct)) {
            return Err(Error::query_builder(
                QueryBuilderErrorKind::InvalidUsage,
                "The query is already distinct",
            ));
        }
        self.select_tokens.insert(0, SelectToken::Distinct);
        Ok(self)
    }

    /// Declare a JavaScript function usable in projections.
    pub fn declare_function(
        &mut self,
        name: &str,
        parameters: &str,
        body: &str,
    ) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        self.declare_tokens.push(DeclareToken {
            name: name.to_string(),
            parameters: parameters.to_string(),
            body: body.to_string(),
        });
        Ok(self)
    }

    /// Load a related document under an alias (`load u.Company as c`).
    pub fn load(&mut self, path: &str, alias: &str) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        if !is_valid_parameter_name(alias) {
            return Err(Error::query_builder(
                QueryBuilderErrorKind::InvalidUsage,
                format!("Alias '{alias}' is not a valid identifier"),
            ));
        }
        self.load_tokens.push(LoadToken {
            path: path.to_string(),
            alias: alias.to_string(),
        });
        Ok(self)
    }

    /// Include related documents referenced by `path` in the response.
    pub fn include(&mut self, path: &str) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        if !self.includes.iter().any(|p| p == path) {
            self.includes.push(path.to_string());
        }
        Ok(self)
    }

    // ==================== Grouping ====================

    pub fn group_by(&mut self, fields: &[&str]) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        if fields.is_empty() {
            return Err(Error::query_builder(
                QueryBuilderErrorKind::InvalidUsage,
                "Group by requires at least one field",
            ));
        }
        for field in fields {
            self.group_by_tokens.push(self.field_name(field));
        }
        Ok(self)
    }

    /// Project the group key; `None` projects `key()`.
    pub fn group_by_key(&mut self, field: Option<&str>, alias: Option<&str>) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        self.select_tokens.push(SelectToken::GroupByKey {
            field: field.map(|f| self.field_name(f)),
            alias: alias.map(str::to_string),
        });
        Ok(self)
    }

    pub fn group_by_sum(&mut self, field: &str, alias: Option<&str>) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        self.select_tokens.push(SelectToken::GroupBySum {
            field: self.field_name(field),
            alias: alias.map(str::to_string),
        });
        Ok(self)
    }

    pub fn group_by_count(&mut self, alias: Option<&str>) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        self.select_tokens.push(SelectToken::GroupByCount {
            alias: alias.map(str::to_string),
        });
        Ok(self)
    }

    // ==================== Paging and flags ====================

    /// Skip the first `n` results.
    pub fn skip(&mut self, n: usize) -> &mut Self {
        self.start = Some(n);
        self
    }

    /// Return at most `n` results.
    pub fn take(&mut self, n: usize) -> &mut Self {
        self.page_size = Some(n);
        self
    }

    pub fn wait_for_non_stale_results(&mut self) -> &mut Self {
        self.wait_for_non_stale_results = true;
        self
    }

    /// Do not track returned entities in the session.
    pub fn no_tracking(&mut self) -> &mut Self {
        self.no_tracking = true;
        self
    }

    /// Bypass the response cache.
    pub fn no_caching(&mut self) -> &mut Self {
        self.no_caching = true;
        self
    }

    pub fn skip_duplicate_checking(&mut self) -> &mut Self {
        self.skip_duplicate_checking = true;
        self
    }

    // ==================== Rendering ====================

    /// Render the query text.
    ///
    /// Sections are written in a fixed order: declare, from, group by,
    /// where, order by, load, select, include.
    pub fn to_query_string(&self) -> Result<String> {
        if let Some(raw) = &self.raw_query {
            return Ok(raw.clone());
        }
        if self.depth != 0 {
            return Err(Error::query_builder(
                QueryBuilderErrorKind::UnbalancedClause,
                format!(
                    "A clause was not closed correctly within this query, current clause depth = {}",
                    self.depth
                ),
            ));
        }
        if self.negate {
            return Err(Error::query_builder(
                QueryBuilderErrorKind::InvalidUsage,
                "negate_next() was called without a following predicate or subclause",
            ));
        }

        let mut out = String::new();
        for token in &self.declare_tokens {
            token.write_to(&mut out);
            out.push('\n');
        }

        self.from.write_to(&mut out);

        if !self.group_by_tokens.is_empty() {
            out.push_str(" group by ");
            for (i, field) in self.group_by_tokens.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_group_by_field(field, &mut out);
            }
        }

        if !self.where_tokens.is_empty() {
            out.push_str(" where ");
            write_where_tokens(&self.where_tokens, &mut out);
        }

        if !self.order_by_tokens.is_empty() {
            out.push_str(" order by ");
            for (i, token) in self.order_by_tokens.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                token.write_to(&mut out);
            }
        }

        if !self.load_tokens.is_empty() {
            out.push_str(" load ");
            for (i, token) in self.load_tokens.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                token.write_to(&mut out);
            }
        }

        if !self.select_tokens.is_empty() {
            out.push_str(" select ");
            write_select_tokens(&self.select_tokens, &mut out);
        }

        if !self.includes.is_empty() {
            out.push_str(" include ");
            for (i, path) in self.includes.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_include(path, &mut out);
            }
        }

        Ok(out)
    }

    /// Freeze text, parameters, paging and flags into a request.
    pub fn to_index_query(&self) -> Result<IndexQuery> {
        Ok(IndexQuery {
            query: self.to_query_string()?,
            query_parameters: self.parameters.clone(),
            start: self.start,
            page_size: self.page_size,
            wait_for_non_stale_results: self.wait_for_non_stale_results,
            skip_duplicate_checking: self.skip_duplicate_checking,
            disable_caching: self.no_caching,
        })
    }

    /// Content hash of the fully populated query.
    pub fn query_hash(&self) -> Result<String> {
        Ok(self.to_index_query()?.query_hash())
    }

    // ==================== Internals ====================

    fn assert_no_raw_query(&self) -> Result<()> {
        if self.raw_query.is_some() {
            return Err(Error::query_builder(
                QueryBuilderErrorKind::RawQuery,
                "Raw query was already set; builder methods cannot be used with a raw query",
            ));
        }
        Ok(())
    }

    /// Map the identity property to `id()`.
    fn field_name(&self, field: &str) -> String {
        if field == self.identity_property {
            "id()".to_string()
        } else {
            field.to_string()
        }
    }

    fn add_query_parameter(&mut self, value: Value) -> String {
        let mut index = self.parameters.len();
        let mut name = format!("p{index}");
        while self.parameters.contains_key(&name) {
            index += 1;
            name = format!("p{index}");
        }
        self.parameters.insert(name.clone(), value);
        name
    }

    fn binary(
        &mut self,
        field: &str,
        operator: WhereOperator,
        value: impl Serialize,
    ) -> Result<WhereToken> {
        self.assert_no_raw_query()?;
        let value = serde_json::to_value(value)?;
        let parameter = self.add_query_parameter(value);
        Ok(WhereToken::new(self.field_name(field), operator, Some(parameter)))
    }

    fn push_where(&mut self, field: &str, token: WhereToken) -> Result<&mut Self> {
        self.append_operator_if_needed();
        let guard = self.field_name(field);
        self.negate_if_needed(Some(&guard));
        tracing::trace!(field = %token.field, operator = ?token.operator, "Appending where token");
        self.where_tokens.push(WhereClauseToken::Where(token));
        Ok(self)
    }

    fn push_operator(&mut self, operator: WhereClauseToken) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        match self.where_tokens.last() {
            None => Ok(self),
            Some(last) if last.is_operator() => Err(Error::query_builder(
                QueryBuilderErrorKind::MisplacedOperator,
                "Cannot add an operator, previous token was already an operator token",
            )),
            Some(WhereClauseToken::OpenSubclause | WhereClauseToken::Not) => {
                Err(Error::query_builder(
                    QueryBuilderErrorKind::MisplacedOperator,
                    "Cannot add an operator directly after an opening parenthesis or a negation",
                ))
            }
            Some(_) => {
                self.where_tokens.push(operator);
                Ok(self)
            }
        }
    }

    fn push_order_by(
        &mut self,
        field: &str,
        descending: bool,
        ordering: OrderingType,
    ) -> Result<&mut Self> {
        self.assert_no_raw_query()?;
        self.order_by_tokens.push(OrderByToken::Field {
            field: self.field_name(field),
            descending,
            ordering,
        });
        Ok(self)
    }

    /// Insert the default operator between two predicates. After a search
    /// the operator is `or` unless one was given explicitly.
    fn append_operator_if_needed(&mut self) {
        let Some(last) = self.where_tokens.last() else {
            return;
        };
        if !matches!(
            last,
            WhereClauseToken::Where(_) | WhereClauseToken::CloseSubclause | WhereClauseToken::True
        ) {
            return;
        }

        let last_where = self.where_tokens.iter().rev().find_map(|t| match t {
            WhereClauseToken::Where(w) => Some(w),
            _ => None,
        });
        let token = match last_where {
            Some(w) if w.options.search_operator.is_some() => WhereClauseToken::Or,
            _ => match self.default_operator {
                QueryOperator::And => WhereClauseToken::And,
                QueryOperator::Or => WhereClauseToken::Or,
            },
        };
        self.where_tokens.push(token);
    }

    /// Emit a pending `not`. When it would open the where list (or a
    /// subclause) an `exists(Field) and` guard goes first.
    fn negate_if_needed(&mut self, field: Option<&str>) {
        if !self.negate {
            return;
        }
        self.negate = false;

        let at_start = matches!(
            self.where_tokens.last(),
            None | Some(WhereClauseToken::OpenSubclause)
        );
        if at_start {
            match field {
                Some(field) => self.where_tokens.push(WhereClauseToken::Where(WhereToken::new(
                    field,
                    WhereOperator::Exists,
                    None,
                ))),
                None => self.where_tokens.push(WhereClauseToken::True),
            }
            self.where_tokens.push(WhereClauseToken::And);
        }
        self.where_tokens.push(WhereClauseToken::Not);
    }

    fn last_predicate_mut(&mut self, modifier: &str) -> Result<&mut WhereToken> {
        self.assert_no_raw_query()?;
        match self.where_tokens.last_mut() {
            Some(WhereClauseToken::Where(token)) => Ok(token),
            None => Err(Error::query_builder(
                QueryBuilderErrorKind::MisplacedModifier,
                format!("Missing where clause before {modifier}"),
            )),
            Some(_) => Err(Error::query_builder(
                QueryBuilderErrorKind::MisplacedModifier,
                format!("Cannot apply {modifier} to a token that is not a predicate"),
            )),
        }
    }
}

fn to_array<V: Serialize>(values: impl IntoIterator<Item = V>) -> Result<Value> {
    let items = values
        .into_iter()
        .map(serde_json::to_value)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(Value::Array(items))
}
