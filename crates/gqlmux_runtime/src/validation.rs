//! Document validation and operation selection.
//!
//! Messages follow the wording of the GraphQL reference implementation so
//! clients see familiar errors.

use crate::error::FieldError;
use crate::schema::Schema;
use gqlmux_core::{DiagnosticBag, Span, SourceLocation};
use gqlmux_syntax::ast::{
    Directive, Document, FragmentDefinition, OperationDefinition, OperationType, Selection,
    SelectionSet, Value,
};
use gqlmux_syntax::MAX_NESTING;
use rustc_hash::{FxHashMap, FxHashSet};

const KNOWN_DIRECTIVES: [&str; 4] = ["skip", "include", "defer", "stream"];

/// Converts the first syntax error of a parse into a GraphQL error.
pub fn syntax_error(source: &str, diagnostics: &DiagnosticBag) -> Option<FieldError> {
    let diagnostic = diagnostics.errors().next()?;
    let mut error = FieldError::request(diagnostic.client_message());
    if let Some(span) = diagnostic.primary_span() {
        error = error.with_location(span.location(source));
    }
    Some(error)
}

/// Picks the operation to run.
pub fn select_operation<'d>(
    document: &'d Document,
    operation_name: Option<&str>,
) -> Result<&'d OperationDefinition, FieldError> {
    match operation_name {
        Some(name) => document
            .operations()
            .find(|op| op.name.as_ref().is_some_and(|n| n.value == name))
            .ok_or_else(|| FieldError::request(format!("Unknown operation named \"{name}\"."))),
        None => {
            let mut operations = document.operations();
            let first = operations
                .next()
                .ok_or_else(|| FieldError::request("Must provide an operation."))?;
            if operations.next().is_some() {
                return Err(FieldError::request(
                    "Must provide operation name if query contains multiple operations.",
                ));
            }
            Ok(first)
        }
    }
}

/// Validates a document against a schema. An empty result means the document
/// can be executed.
pub fn validate(schema: &Schema, document: &Document) -> Vec<FieldError> {
    let mut validator = Validator {
        schema,
        document,
        errors: Vec::new(),
    };
    validator.run();
    validator.errors
}

struct Validator<'a> {
    schema: &'a Schema,
    document: &'a Document,
    errors: Vec<FieldError>,
}

impl<'a> Validator<'a> {
    fn report(&mut self, message: String, spans: &[Span]) {
        let mut error = FieldError::request(message);
        for span in spans {
            error = error.with_location(self.location(*span));
        }
        self.errors.push(error);
    }

    fn location(&self, span: Span) -> SourceLocation {
        self.document.location(span)
    }

    fn run(&mut self) {
        self.check_operation_names();
        self.check_fragment_definitions();

        let document = self.document;
        for operation in document.operations() {
            self.check_operation(operation);
        }
    }

    fn check_operation_names(&mut self) {
        let document = self.document;
        let count = document.operations().count();
        let mut seen: FxHashMap<&str, Span> = FxHashMap::default();

        for operation in document.operations() {
            match &operation.name {
                None if count > 1 => self.report(
                    "This anonymous operation must be the only defined operation.".to_string(),
                    &[operation.span],
                ),
                None => {}
                Some(name) => {
                    if let Some(first) = seen.insert(&name.value, name.span) {
                        self.report(
                            format!("There can be only one operation named \"{}\".", name.value),
                            &[first, name.span],
                        );
                    }
                }
            }
        }
    }

    fn check_fragment_definitions(&mut self) {
        let document = self.document;
        let mut seen: FxHashMap<&str, Span> = FxHashMap::default();
        let mut used = FxHashSet::default();
        for operation in document.operations() {
            self.collect_spreads(&operation.selection_set, &mut used);
        }

        for fragment in document.fragments() {
            let name = &fragment.name.value;
            if let Some(first) = seen.insert(name, fragment.name.span) {
                self.report(
                    format!("There can be only one fragment named \"{name}\"."),
                    &[first, fragment.name.span],
                );
            }
            if !used.contains(name.as_str()) {
                self.report(format!("Fragment \"{name}\" is never used."), &[fragment.span]);
            }

            let condition = &fragment.type_condition;
            if self.schema.is_scalar(&condition.value) {
                self.report(
                    format!(
                        "Fragment \"{name}\" cannot condition on non composite type \"{}\".",
                        condition.value
                    ),
                    &[condition.span],
                );
                continue;
            }
            if self.schema.object(&condition.value).is_none() {
                self.report(format!("Unknown type \"{}\".", condition.value), &[condition.span]);
                continue;
            }

            self.check_directives(&fragment.directives);
            self.check_selection_set(&condition.value, &fragment.selection_set);
        }

        for fragment in document.fragments() {
            if self.spreads_itself(fragment, &fragment.name.value) {
                self.report(
                    format!("Cannot spread fragment \"{}\" within itself.", fragment.name.value),
                    &[fragment.name.span],
                );
            }
        }
    }

    /// Transitively collects fragment names spread from a selection set.
    fn collect_spreads<'d>(&self, set: &'d SelectionSet, used: &mut FxHashSet<&'d str>)
    where
        'a: 'd,
    {
        let mut pending = vec![set];
        while let Some(set) = pending.pop() {
            let mut direct = FxHashSet::default();
            direct_spreads(set, &mut direct);
            for name in direct {
                if used.insert(name) {
                    if let Some(fragment) = self.document.fragment(name) {
                        pending.push(&fragment.selection_set);
                    }
                }
            }
        }
    }

    fn spreads_itself(&self, fragment: &FragmentDefinition, target: &str) -> bool {
        let mut visited = FxHashSet::default();
        let mut pending = vec![fragment];
        while let Some(current) = pending.pop() {
            let mut direct = FxHashSet::default();
            direct_spreads(&current.selection_set, &mut direct);
            for name in direct {
                if name == target {
                    return true;
                }
                if visited.insert(name) {
                    if let Some(next) = self.document.fragment(name) {
                        pending.push(next);
                    }
                }
            }
        }
        false
    }

    fn check_operation(&mut self, operation: &OperationDefinition) {
        let schema = self.schema;
        let root = match operation.operation {
            OperationType::Query => Some(schema.query_type()),
            OperationType::Mutation => schema.mutation_type(),
            OperationType::Subscription => schema.subscription_type(),
        };
        let Some(root) = root else {
            self.report(
                format!(
                    "Schema is not configured to execute {} operation.",
                    operation.operation
                ),
                &[operation.span],
            );
            return;
        };

        if operation.operation == OperationType::Subscription {
            let mut keys = FxHashSet::default();
            let mut visited = FxHashSet::default();
            self.root_response_keys(&operation.selection_set, &mut keys, &mut visited);
            if keys.len() != 1 {
                let message = match &operation.name {
                    Some(name) => format!(
                        "Subscription \"{}\" must select only one top level field.",
                        name.value
                    ),
                    None => "Anonymous Subscription must select only one top level field.".to_string(),
                };
                self.report(message, &[operation.selection_set.span]);
            }
        }

        let mut memo = FxHashMap::default();
        let nesting = self
            .nesting(&operation.selection_set, 0, &mut memo, &mut Vec::new())
            .map(|depth| depth + 1);
        if !nesting.is_some_and(|depth| depth <= MAX_NESTING) {
            self.report("Document nested too deeply.".to_string(), &[operation.span]);
        }

        self.check_variables(operation);
        self.check_directives(&operation.directives);
        self.check_selection_set(root, &operation.selection_set);
    }

    /// Selection-set nesting below `set` with fragment spreads expanded.
    /// `None` once the walk, which also steps through each spread, goes past
    /// twice [`MAX_NESTING`] levels.
    fn nesting<'d>(
        &self,
        set: &'d SelectionSet,
        level: usize,
        memo: &mut FxHashMap<&'d str, usize>,
        path: &mut Vec<&'d str>,
    ) -> Option<usize>
    where
        'a: 'd,
    {
        if level >= 2 * MAX_NESTING {
            return None;
        }
        let mut max = 0;
        for selection in &set.selections {
            let depth = match selection {
                Selection::Field(field) => match &field.selection_set {
                    Some(sub) => 1 + self.nesting(sub, level + 1, memo, path)?,
                    None => 0,
                },
                Selection::InlineFragment(inline) => {
                    self.nesting(&inline.selection_set, level + 1, memo, path)?
                }
                Selection::FragmentSpread(spread) => {
                    let name = spread.name.as_str();
                    if path.contains(&name) {
                        0
                    } else if let Some(depth) = memo.get(name) {
                        *depth
                    } else if let Some(fragment) = self.document.fragment(name) {
                        path.push(name);
                        let depth = self.nesting(&fragment.selection_set, level + 1, memo, path)?;
                        path.pop();
                        memo.insert(name, depth);
                        depth
                    } else {
                        0
                    }
                }
            };
            max = max.max(depth);
        }
        Some(max)
    }

    fn root_response_keys<'d>(
        &self,
        set: &'d SelectionSet,
        keys: &mut FxHashSet<&'d str>,
        visited: &mut FxHashSet<&'d str>,
    ) where
        'a: 'd,
    {
        for selection in &set.selections {
            match selection {
                Selection::Field(field) => {
                    keys.insert(field.response_key());
                }
                Selection::InlineFragment(inline) => {
                    self.root_response_keys(&inline.selection_set, keys, visited);
                }
                Selection::FragmentSpread(spread) => {
                    if visited.insert(&spread.name.value) {
                        if let Some(fragment) = self.document.fragment(&spread.name.value) {
                            self.root_response_keys(&fragment.selection_set, keys, visited);
                        }
                    }
                }
            }
        }
    }

    fn check_variables(&mut self, operation: &OperationDefinition) {
        let mut defined: FxHashMap<&str, Span> = FxHashMap::default();
        for variable in &operation.variables {
            let name = variable.name.value.as_str();
            if defined.insert(name, variable.name.span).is_some() {
                self.report(
                    format!("There can be only one variable named \"${name}\"."),
                    &[variable.name.span],
                );
            }
            if !self.schema.is_scalar(variable.ty.base_name()) {
                self.report(
                    format!(
                        "Variable \"${name}\" cannot be non-input type \"{}\".",
                        variable.ty
                    ),
                    &[variable.span],
                );
            }
        }

        let mut used = Vec::new();
        let mut visited = FxHashSet::default();
        self.variable_usages(&operation.selection_set, &mut used, &mut visited);
        for directive in &operation.directives {
            for arg in &directive.arguments {
                value_variables(&arg.value, arg.span, &mut used);
            }
        }

        let op_suffix = operation
            .name
            .as_ref()
            .map(|n| format!(" by operation \"{}\"", n.value))
            .unwrap_or_default();
        let mut reported = FxHashSet::default();
        for (name, span) in &used {
            if !defined.contains_key(name.as_str()) && reported.insert(name.clone()) {
                self.report(
                    format!("Variable \"${name}\" is not defined{op_suffix}."),
                    &[*span, operation.span],
                );
            }
        }

        let used_names: FxHashSet<&str> = used.iter().map(|(n, _)| n.as_str()).collect();
        for variable in &operation.variables {
            let name = &variable.name.value;
            if !used_names.contains(name.as_str()) {
                let message = match &operation.name {
                    Some(op) => format!("Variable \"${name}\" is never used in operation \"{}\".", op.value),
                    None => format!("Variable \"${name}\" is never used."),
                };
                self.report(message, &[variable.span]);
            }
        }
    }

    fn variable_usages<'d>(
        &self,
        set: &'d SelectionSet,
        used: &mut Vec<(String, Span)>,
        visited: &mut FxHashSet<&'d str>,
    ) where
        'a: 'd,
    {
        for selection in &set.selections {
            for directive in selection.directives() {
                for arg in &directive.arguments {
                    value_variables(&arg.value, arg.span, used);
                }
            }
            match selection {
                Selection::Field(field) => {
                    for arg in &field.arguments {
                        value_variables(&arg.value, arg.span, used);
                    }
                    if let Some(sub) = &field.selection_set {
                        self.variable_usages(sub, used, visited);
                    }
                }
                Selection::InlineFragment(inline) => {
                    self.variable_usages(&inline.selection_set, used, visited);
                }
                Selection::FragmentSpread(spread) => {
                    if visited.insert(&spread.name.value) {
                        if let Some(fragment) = self.document.fragment(&spread.name.value) {
                            for directive in &fragment.directives {
                                for arg in &directive.arguments {
                                    value_variables(&arg.value, arg.span, used);
                                }
                            }
                            self.variable_usages(&fragment.selection_set, used, visited);
                        }
                    }
                }
            }
        }
    }

    fn check_directives(&mut self, directives: &[Directive]) {
        for directive in directives {
            let name = &directive.name.value;
            if !KNOWN_DIRECTIVES.contains(&name.as_str()) {
                self.report(format!("Unknown directive \"@{name}\"."), &[directive.span]);
            }
        }
    }

    fn check_selection_set(&mut self, parent_type: &str, set: &SelectionSet) {
        let schema = self.schema;
        let document = self.document;
        for selection in &set.selections {
            self.check_directives(selection.directives());
            match selection {
                Selection::Field(field) => {
                    let name = &field.name.value;
                    if name == "__typename" {
                        if let Some(sub) = &field.selection_set {
                            self.report(
                                format!("Field \"{name}\" must not have a selection since type \"String!\" has no subfields."),
                                &[sub.span],
                            );
                        }
                        continue;
                    }

                    let Some(def) = schema.field(parent_type, name) else {
                        self.report(
                            format!("Cannot query field \"{name}\" on type \"{parent_type}\"."),
                            &[field.span],
                        );
                        continue;
                    };

                    for arg in &field.arguments {
                        if !def.arguments.contains_key(&arg.name.value) {
                            self.report(
                                format!(
                                    "Unknown argument \"{}\" on field \"{parent_type}.{name}\".",
                                    arg.name.value
                                ),
                                &[arg.span],
                            );
                        }
                    }

                    let base = def.ty.base_name().to_string();
                    let is_object = schema.object(&base).is_some();
                    match (&field.selection_set, is_object) {
                        (Some(sub), true) => self.check_selection_set(&base, sub),
                        (None, true) => self.report(
                            format!(
                                "Field \"{name}\" of type \"{}\" must have a selection of subfields. Did you mean \"{name} {{ ... }}\"?",
                                def.ty
                            ),
                            &[field.span],
                        ),
                        (Some(sub), false) => self.report(
                            format!(
                                "Field \"{name}\" must not have a selection since type \"{}\" has no subfields.",
                                def.ty
                            ),
                            &[sub.span],
                        ),
                        (None, false) => {}
                    }
                }
                Selection::InlineFragment(inline) => {
                    let target = match &inline.type_condition {
                        None => parent_type.to_string(),
                        Some(condition) => {
                            if schema.object(&condition.value).is_none() {
                                self.report(
                                    format!("Unknown type \"{}\".", condition.value),
                                    &[condition.span],
                                );
                                continue;
                            }
                            if condition.value != parent_type {
                                self.report(
                                    format!(
                                        "Fragment cannot be spread here as objects of type \"{parent_type}\" can never be of type \"{}\".",
                                        condition.value
                                    ),
                                    &[inline.span],
                                );
                                continue;
                            }
                            condition.value.clone()
                        }
                    };
                    self.check_selection_set(&target, &inline.selection_set);
                }
                Selection::FragmentSpread(spread) => {
                    let name = &spread.name.value;
                    let Some(fragment) = document.fragment(name) else {
                        self.report(format!("Unknown fragment \"{name}\"."), &[spread.name.span]);
                        continue;
                    };
                    let condition = &fragment.type_condition.value;
                    if schema.object(condition).is_some() && condition != parent_type {
                        self.report(
                            format!(
                                "Fragment \"{name}\" cannot be spread here as objects of type \"{parent_type}\" can never be of type \"{condition}\"."
                            ),
                            &[spread.span],
                        );
                    }
                }
            }
        }
    }
}

fn direct_spreads<'d>(set: &'d SelectionSet, out: &mut FxHashSet<&'d str>) {
    for selection in &set.selections {
        match selection {
            Selection::Field(field) => {
                if let Some(sub) = &field.selection_set {
                    direct_spreads(sub, out);
                }
            }
            Selection::InlineFragment(inline) => direct_spreads(&inline.selection_set, out),
            Selection::FragmentSpread(spread) => {
                out.insert(&spread.name.value);
            }
        }
    }
}

fn value_variables(value: &Value, span: Span, out: &mut Vec<(String, Span)>) {
    match value {
        Value::Variable(name) => out.push((name.value.clone(), span)),
        Value::List(items) => {
            for item in items {
                value_variables(item, span, out);
            }
        }
        Value::Object(fields) => {
            for (_, item) in fields {
                value_variables(item, span, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, ObjectDef, SchemaBuilder, TypeRef};
    use futures_util::StreamExt;

    fn schema() -> Schema {
        SchemaBuilder::new()
            .mutation_type("Mutation")
            .subscription_type("Subscription")
            .object(
                ObjectDef::new("Query")
                    .field("version", TypeRef::named("String"))
                    .field("user", TypeRef::named("User"))
                    .field_def(
                        FieldDef::new("hello", TypeRef::named("String")).argument(
                            "name",
                            TypeRef::named("String"),
                            None,
                        ),
                    ),
            )
            .object(
                ObjectDef::new("User")
                    .field("id", TypeRef::named("ID"))
                    .field("friend", TypeRef::named("User")),
            )
            .object(ObjectDef::new("Mutation").field("publish", TypeRef::named("Boolean")))
            .object(
                ObjectDef::new("Subscription")
                    .field("tick", TypeRef::named("Int"))
                    .field("tock", TypeRef::named("Int")),
            )
            .subscription_fn("tick", |_, _| async { Ok(futures_util::stream::empty().boxed()) })
            .subscription_fn("tock", |_, _| async { Ok(futures_util::stream::empty().boxed()) })
            .build()
            .unwrap()
    }

    fn messages(source: &str) -> Vec<String> {
        let parsed = gqlmux_syntax::parse(source);
        assert!(!parsed.has_errors(), "{:?}", parsed.diagnostics);
        validate(&schema(), &parsed.document)
            .into_iter()
            .map(|e| e.message)
            .collect()
    }

    #[test]
    fn test_valid_document() {
        assert!(messages(
            "query Q($n: String) { version user { id ...F } hello(name: $n) } fragment F on User { friend { id } }"
        )
        .is_empty());
    }

    #[test]
    fn test_unknown_field() {
        assert_eq!(
            messages("{ nope }"),
            vec!["Cannot query field \"nope\" on type \"Query\"."]
        );
    }

    #[test]
    fn test_unknown_field_location() {
        let parsed = gqlmux_syntax::parse("{\n  nope\n}");
        let errors = validate(&schema(), &parsed.document);
        assert_eq!(
            errors[0].locations,
            Some(vec![SourceLocation { line: 2, column: 3 }])
        );
    }

    #[test]
    fn test_leaf_and_composite_selections() {
        assert_eq!(
            messages("{ user }"),
            vec!["Field \"user\" of type \"User\" must have a selection of subfields. Did you mean \"user { ... }\"?"]
        );
        assert_eq!(
            messages("{ version { x } }"),
            vec!["Field \"version\" must not have a selection since type \"String\" has no subfields."]
        );
    }

    #[test]
    fn test_fragments() {
        assert_eq!(messages("{ user { ...Missing } }"), vec!["Unknown fragment \"Missing\"."]);
        assert_eq!(
            messages("{ version } fragment F on User { id }"),
            vec!["Fragment \"F\" is never used."]
        );
        let cyclic = messages("{ user { ...A } } fragment A on User { ...B } fragment B on User { ...A }");
        assert!(cyclic.contains(&"Cannot spread fragment \"A\" within itself.".to_string()));
    }

    #[test]
    fn test_subscription_single_root_field() {
        assert!(messages("subscription { tick }").is_empty());
        assert_eq!(
            messages("subscription S { tick tock }"),
            vec!["Subscription \"S\" must select only one top level field."]
        );
    }

    fn fragment_chain(length: usize, spreads_per_fragment: usize) -> String {
        let spreads = |n: usize| -> String {
            (0..spreads_per_fragment)
                .map(|i| format!("f{i}: friend {{ ...F{n} }}"))
                .collect::<Vec<_>>()
                .join(" ")
        };
        let mut source = format!("{{ user {{ {} }} }}", spreads(0));
        for n in 0..length {
            let body = if n + 1 == length { "id".to_string() } else { spreads(n + 1) };
            source.push_str(&format!("\nfragment F{n} on User {{ {body} }}"));
        }
        source
    }

    #[test]
    fn test_nesting_through_fragments() {
        assert!(messages(&fragment_chain(100, 1)).is_empty());
        assert_eq!(
            messages(&fragment_chain(2_000, 1)),
            vec!["Document nested too deeply."]
        );
        // Each fragment is expanded once, however often it is spread.
        assert!(messages(&fragment_chain(60, 3)).is_empty());
    }

    #[test]
    fn test_variables() {
        assert_eq!(
            messages("query Q { hello(name: $who) }"),
            vec!["Variable \"$who\" is not defined by operation \"Q\"."]
        );
        assert_eq!(
            messages("query ($x: String) { version }"),
            vec!["Variable \"$x\" is never used."]
        );
    }

    #[test]
    fn test_unknown_directive_and_argument() {
        assert_eq!(messages("{ version @cached }"), vec!["Unknown directive \"@cached\"."]);
        assert_eq!(
            messages("{ hello(nmae: \"x\") }"),
            vec!["Unknown argument \"nmae\" on field \"Query.hello\"."]
        );
    }

    #[test]
    fn test_select_operation() {
        let parsed = gqlmux_syntax::parse("query A { version } query B { version }");
        let doc = &parsed.document;

        assert_eq!(
            select_operation(doc, Some("B")).unwrap().name.as_ref().unwrap().value,
            "B"
        );
        assert_eq!(
            select_operation(doc, None).unwrap_err().message,
            "Must provide operation name if query contains multiple operations."
        );
        assert_eq!(
            select_operation(doc, Some("C")).unwrap_err().message,
            "Unknown operation named \"C\"."
        );
    }

    #[test]
    fn test_syntax_error() {
        let source = "{ version";
        let parsed = gqlmux_syntax::parse(source);
        let error = syntax_error(source, &parsed.diagnostics).unwrap();
        assert_eq!(error.message, "Syntax Error: Expected Name, found <EOF>.");
        assert_eq!(error.locations, Some(vec![SourceLocation { line: 1, column: 10 }]));
    }
}
