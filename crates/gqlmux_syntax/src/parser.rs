//! Recursive descent parser for GraphQL executable documents.

use crate::ast::*;
use crate::lexer::{block_string_value, string_value, Lexer};
use crate::token::{Token, TokenKind};
use gqlmux_core::{diagnostics::codes, DiagnosticBag, Span};
use std::sync::Arc;

/// Deepest nesting of selection sets, list and object values, and list types
/// the parser descends into. Deeper documents are rejected with one diagnostic.
pub const MAX_NESTING: usize = 128;

/// Parser for GraphQL executable documents.
pub struct Parser<'a> {
    source: &'a str,
    lexer: Lexer<'a>,
    current: Token,
    prev_end: u32,
    diagnostics: DiagnosticBag,
    nesting: usize,
    /// Set once the nesting limit is hit; the rest of the input is skipped.
    aborted: bool,
}

/// Result of parsing.
#[derive(Debug)]
pub struct ParseResult {
    pub document: Document,
    pub diagnostics: DiagnosticBag,
}

impl ParseResult {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics.has_errors()
    }
}

/// Parses a source string into a document.
pub fn parse(source: &str) -> ParseResult {
    let mut parser = Parser::new(source);
    let document = parser.parse_document();
    ParseResult {
        document,
        diagnostics: parser.diagnostics,
    }
}

impl<'a> Parser<'a> {
    /// Creates a new parser.
    pub fn new(source: &'a str) -> Self {
        let mut parser = Self {
            source,
            lexer: Lexer::new(source),
            current: Token::new(TokenKind::Eof, Span::empty(0)),
            prev_end: 0,
            diagnostics: DiagnosticBag::new(),
            nesting: 0,
            aborted: false,
        };
        parser.bump();
        parser
    }

    #[inline]
    fn at(&self) -> TokenKind {
        self.current.kind
    }

    #[inline]
    fn at_kind(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    /// Moves to the next significant token, reporting lexical errors on the way.
    fn bump(&mut self) {
        loop {
            let token = self.lexer.next_token();
            if token.kind != TokenKind::Error {
                self.current = token;
                return;
            }
            if let Some(error) = self.lexer.take_error() {
                if self.aborted {
                    continue;
                }
                self.diagnostics
                    .error(error.code, "invalid token", token.span, error.message);
            }
        }
    }

    fn advance(&mut self) {
        self.prev_end = self.current.span.end;
        self.bump();
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at_kind(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> bool {
        if self.eat(kind) {
            true
        } else {
            self.error_expected(&kind.describe());
            false
        }
    }

    /// Consumes the closing token of a non-empty list. Returns true when the
    /// list is finished, reporting `expected` if the input ran out instead.
    fn close_list(&mut self, close: TokenKind, expected: &str) -> bool {
        if self.eat(close) {
            return true;
        }
        if self.at_kind(TokenKind::Eof) {
            self.error_expected(expected);
            return true;
        }
        false
    }

    /// Enters one nesting level. Past [`MAX_NESTING`] this reports the
    /// document, skips to the end of input and returns false.
    fn enter(&mut self) -> bool {
        if self.nesting < MAX_NESTING && !self.aborted {
            self.nesting += 1;
            return true;
        }
        if !self.aborted {
            self.diagnostics.error(
                codes::NESTING_TOO_DEEP,
                "nested too deeply",
                self.current.span,
                "Document nested too deeply.",
            );
            self.aborted = true;
        }
        while !self.at_kind(TokenKind::Eof) {
            self.advance();
        }
        false
    }

    fn leave(&mut self) {
        self.nesting -= 1;
    }

    fn current_text(&self) -> &'a str {
        self.lexer.span_text(self.current.span)
    }

    fn span_from(&self, start: u32) -> Span {
        Span::new(start, self.prev_end.max(start))
    }

    /// Describes the current token for error messages.
    fn found(&self) -> String {
        match self.at() {
            TokenKind::Eof => "<EOF>".to_string(),
            TokenKind::Name | TokenKind::IntLiteral | TokenKind::FloatLiteral => {
                format!("{} \"{}\"", self.at().as_str(), self.current_text())
            }
            kind if kind.is_keyword() => format!("Name \"{}\"", self.current_text()),
            kind => kind.describe(),
        }
    }

    fn error_expected(&mut self, expected: &str) {
        if self.aborted {
            return;
        }
        let code = if self.at_kind(TokenKind::Eof) {
            codes::UNEXPECTED_EOF
        } else {
            codes::UNEXPECTED_TOKEN
        };
        let message = format!("Expected {expected}, found {}.", self.found());
        self.diagnostics
            .error(code, "unexpected token", self.current.span, message);
    }

    fn error_unexpected(&mut self) {
        if self.aborted {
            return;
        }
        let code = if self.at_kind(TokenKind::Eof) {
            codes::UNEXPECTED_EOF
        } else {
            codes::UNEXPECTED_TOKEN
        };
        let message = format!("Unexpected {}.", self.found());
        self.diagnostics
            .error(code, "unexpected token", self.current.span, message);
    }

    /// Parses a document.
    pub fn parse_document(&mut self) -> Document {
        let start = self.current.span.start;
        let mut definitions = Vec::new();

        if self.at_kind(TokenKind::Eof) {
            self.error_unexpected();
        }

        while !self.at_kind(TokenKind::Eof) {
            let before = self.current.span.start;
            if let Some(def) = self.parse_definition() {
                definitions.push(def);
            }
            if self.current.span.start == before && !self.at_kind(TokenKind::Eof) {
                self.advance();
            }
        }

        Document {
            definitions,
            span: self.span_from(start),
            source: Arc::from(self.source),
        }
    }

    fn parse_definition(&mut self) -> Option<Definition> {
        match self.at() {
            TokenKind::LBrace
            | TokenKind::Query
            | TokenKind::Mutation
            | TokenKind::Subscription => Some(Definition::Operation(self.parse_operation())),
            TokenKind::Fragment => Some(Definition::Fragment(self.parse_fragment_definition())),
            _ => {
                self.error_unexpected();
                None
            }
        }
    }

    fn parse_name(&mut self) -> Name {
        let span = self.current.span;
        if self.at().is_name() {
            let value = self.current_text().to_string();
            self.advance();
            Name::new(value, span)
        } else {
            self.error_expected("Name");
            Name::new(String::new(), Span::empty(span.start))
        }
    }

    fn parse_operation(&mut self) -> OperationDefinition {
        let start = self.current.span.start;

        if self.at_kind(TokenKind::LBrace) {
            let selection_set = self.parse_selection_set();
            return OperationDefinition {
                operation: OperationType::Query,
                name: None,
                variables: Vec::new(),
                directives: Vec::new(),
                selection_set,
                span: self.span_from(start),
            };
        }

        let operation = match self.at() {
            TokenKind::Mutation => OperationType::Mutation,
            TokenKind::Subscription => OperationType::Subscription,
            _ => OperationType::Query,
        };
        self.advance();

        let name = if self.at().is_name() {
            Some(self.parse_name())
        } else {
            None
        };

        let variables = if self.at_kind(TokenKind::LParen) {
            self.parse_variable_definitions()
        } else {
            Vec::new()
        };

        let directives = self.parse_directives(false);
        let selection_set = self.parse_selection_set();

        OperationDefinition {
            operation,
            name,
            variables,
            directives,
            selection_set,
            span: self.span_from(start),
        }
    }

    fn parse_variable_definitions(&mut self) -> Vec<VariableDefinition> {
        self.advance(); // (
        let mut vars = Vec::new();
        loop {
            let before = self.current.span.start;
            vars.push(self.parse_variable_definition());
            if self.close_list(TokenKind::RParen, "\"$\"") {
                break;
            }
            if self.current.span.start == before {
                self.advance();
            }
        }
        vars
    }

    fn parse_variable_definition(&mut self) -> VariableDefinition {
        let start = self.current.span.start;
        self.expect(TokenKind::Dollar);
        let name = self.parse_name();
        self.expect(TokenKind::Colon);
        let ty = self.parse_type();

        let default_value = if self.eat(TokenKind::Eq) {
            Some(self.parse_value(true))
        } else {
            None
        };

        let directives = self.parse_directives(true);

        VariableDefinition {
            name,
            ty,
            default_value,
            directives,
            span: self.span_from(start),
        }
    }

    fn parse_type(&mut self) -> Type {
        let ty = if self.eat(TokenKind::LBracket) {
            if !self.enter() {
                return Type::Named(Name::new(String::new(), Span::empty(self.prev_end)));
            }
            let inner = self.parse_type();
            self.leave();
            self.expect(TokenKind::RBracket);
            Type::List(Box::new(inner))
        } else {
            Type::Named(self.parse_name())
        };

        if self.eat(TokenKind::Bang) {
            Type::NonNull(Box::new(ty))
        } else {
            ty
        }
    }

    fn parse_fragment_definition(&mut self) -> FragmentDefinition {
        let start = self.current.span.start;
        self.advance(); // fragment

        if self.at_kind(TokenKind::On) {
            self.error_unexpected();
        }
        let name = self.parse_name();
        self.expect(TokenKind::On);
        let type_condition = self.parse_name();
        let directives = self.parse_directives(false);
        let selection_set = self.parse_selection_set();

        FragmentDefinition {
            name,
            type_condition,
            directives,
            selection_set,
            span: self.span_from(start),
        }
    }

    fn parse_selection_set(&mut self) -> SelectionSet {
        let start = self.current.span.start;
        if !self.enter() {
            return SelectionSet {
                selections: Vec::new(),
                span: Span::empty(start),
            };
        }
        let set = self.parse_selections(start);
        self.leave();
        set
    }

    fn parse_selections(&mut self, start: u32) -> SelectionSet {
        let mut selections = Vec::new();

        if !self.expect(TokenKind::LBrace) {
            return SelectionSet {
                selections,
                span: Span::empty(start),
            };
        }

        loop {
            let before = self.current.span.start;
            selections.push(self.parse_selection());
            if self.close_list(TokenKind::RBrace, "Name") {
                break;
            }
            if self.current.span.start == before {
                self.advance();
            }
        }

        SelectionSet {
            selections,
            span: self.span_from(start),
        }
    }

    fn parse_selection(&mut self) -> Selection {
        if !self.at_kind(TokenKind::Spread) {
            return Selection::Field(self.parse_field());
        }

        let start = self.current.span.start;
        self.advance(); // ...

        if self.at_kind(TokenKind::On) {
            self.advance();
            let type_condition = Some(self.parse_name());
            let directives = self.parse_directives(false);
            let selection_set = self.parse_selection_set();
            Selection::InlineFragment(InlineFragment {
                type_condition,
                directives,
                selection_set,
                span: self.span_from(start),
            })
        } else if self.at_kind(TokenKind::LBrace) || self.at_kind(TokenKind::At) {
            let directives = self.parse_directives(false);
            let selection_set = self.parse_selection_set();
            Selection::InlineFragment(InlineFragment {
                type_condition: None,
                directives,
                selection_set,
                span: self.span_from(start),
            })
        } else {
            let name = self.parse_name();
            let directives = self.parse_directives(false);
            Selection::FragmentSpread(FragmentSpread {
                name,
                directives,
                span: self.span_from(start),
            })
        }
    }

    fn parse_field(&mut self) -> Field {
        let start = self.current.span.start;

        let first_name = self.parse_name();
        let (alias, name) = if self.eat(TokenKind::Colon) {
            (Some(first_name), self.parse_name())
        } else {
            (None, first_name)
        };

        let arguments = self.parse_arguments(false);
        let directives = self.parse_directives(false);

        let selection_set = if self.at_kind(TokenKind::LBrace) {
            Some(self.parse_selection_set())
        } else {
            None
        };

        Field {
            alias,
            name,
            arguments,
            directives,
            selection_set,
            span: self.span_from(start),
        }
    }

    fn parse_directives(&mut self, is_const: bool) -> Vec<Directive> {
        let mut directives = Vec::new();
        while self.at_kind(TokenKind::At) {
            let start = self.current.span.start;
            self.advance(); // @
            let name = self.parse_name();
            let arguments = self.parse_arguments(is_const);
            directives.push(Directive {
                name,
                arguments,
                span: self.span_from(start),
            });
        }
        directives
    }

    fn parse_arguments(&mut self, is_const: bool) -> Vec<Argument> {
        let mut args = Vec::new();
        if !self.eat(TokenKind::LParen) {
            return args;
        }

        loop {
            let before = self.current.span.start;
            let start = self.current.span.start;
            let name = self.parse_name();
            self.expect(TokenKind::Colon);
            let value = self.parse_value(is_const);
            args.push(Argument {
                name,
                value,
                span: self.span_from(start),
            });
            if self.close_list(TokenKind::RParen, "Name") {
                break;
            }
            if self.current.span.start == before {
                self.advance();
            }
        }
        args
    }

    /// Parses a value. Variables are rejected where only constants are allowed.
    fn parse_value(&mut self, is_const: bool) -> Value {
        match self.at() {
            TokenKind::Dollar if !is_const => {
                self.advance();
                Value::Variable(self.parse_name())
            }
            TokenKind::IntLiteral => {
                let span = self.current.span;
                let text = self.current_text();
                self.advance();
                match text.parse::<i64>() {
                    Ok(value) => Value::Int(value),
                    Err(_) => {
                        self.diagnostics.error(
                            codes::INVALID_NUMBER,
                            "invalid number",
                            span,
                            format!("Integer literal {text} is out of range."),
                        );
                        Value::Null
                    }
                }
            }
            TokenKind::FloatLiteral => {
                let text = self.current_text();
                self.advance();
                Value::Float(text.parse().unwrap_or(0.0))
            }
            TokenKind::StringLiteral => {
                let span = self.current.span;
                let raw = self.current_text();
                self.advance();
                match string_value(raw) {
                    Ok(value) => Value::String(value),
                    Err(message) => {
                        self.diagnostics
                            .error(codes::INVALID_ESCAPE, "invalid escape", span, message);
                        Value::Null
                    }
                }
            }
            TokenKind::BlockStringLiteral => {
                let raw = self.current_text();
                self.advance();
                Value::String(block_string_value(raw))
            }
            TokenKind::True => {
                self.advance();
                Value::Boolean(true)
            }
            TokenKind::False => {
                self.advance();
                Value::Boolean(false)
            }
            TokenKind::Null => {
                self.advance();
                Value::Null
            }
            TokenKind::LBracket => {
                self.advance();
                if !self.enter() {
                    return Value::Null;
                }
                let mut values = Vec::new();
                while !self.at_kind(TokenKind::RBracket) && !self.at_kind(TokenKind::Eof) {
                    let before = self.current.span.start;
                    values.push(self.parse_value(is_const));
                    if self.current.span.start == before {
                        self.advance();
                    }
                }
                self.leave();
                self.expect(TokenKind::RBracket);
                Value::List(values)
            }
            TokenKind::LBrace => {
                self.advance();
                if !self.enter() {
                    return Value::Null;
                }
                let mut fields = Vec::new();
                while !self.at_kind(TokenKind::RBrace) && !self.at_kind(TokenKind::Eof) {
                    let before = self.current.span.start;
                    let name = self.parse_name();
                    self.expect(TokenKind::Colon);
                    let value = self.parse_value(is_const);
                    fields.push((name, value));
                    if self.current.span.start == before {
                        self.advance();
                    }
                }
                self.leave();
                self.expect(TokenKind::RBrace);
                Value::Object(fields)
            }
            TokenKind::Name
            | TokenKind::Query
            | TokenKind::Mutation
            | TokenKind::Subscription
            | TokenKind::Fragment
            | TokenKind::On => {
                let value = self.current_text().to_string();
                self.advance();
                Value::Enum(value)
            }
            _ => {
                self.error_unexpected();
                Value::Null
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Document {
        let result = parse(source);
        assert!(
            !result.has_errors(),
            "unexpected diagnostics: {:?}",
            result.diagnostics
        );
        result.document
    }

    fn first_error(source: &str) -> String {
        let result = parse(source);
        let message = result
            .diagnostics
            .errors()
            .next()
            .map(|d| d.client_message())
            .unwrap_or_default();
        message
    }

    #[test]
    fn test_parse_shorthand_query() {
        let doc = parse_ok("{ version }");
        let op = doc.operations().next().unwrap();
        assert_eq!(op.operation, OperationType::Query);
        assert!(op.name.is_none());
        assert_eq!(op.selection_set.selections.len(), 1);
    }

    #[test]
    fn test_parse_named_operation_with_variables() {
        let doc = parse_ok(
            "query Greet($name: String! = \"world\", $ids: [ID!]) { hello(name: $name) }",
        );
        let op = doc.operations().next().unwrap();
        assert_eq!(op.name.as_ref().unwrap().value, "Greet");
        assert_eq!(op.variables.len(), 2);
        assert_eq!(op.variables[0].ty.to_string(), "String!");
        assert_eq!(
            op.variables[0].default_value,
            Some(Value::String("world".into()))
        );
        assert_eq!(op.variables[1].ty.to_string(), "[ID!]");

        let Selection::Field(field) = &op.selection_set.selections[0] else {
            panic!("expected field");
        };
        assert!(matches!(&field.arguments[0].value, Value::Variable(name) if name.value == "name"));
    }

    #[test]
    fn test_parse_fragments_and_directives() {
        let doc = parse_ok(
            r#"
            query {
                user {
                    ...UserFields @defer(label: "fields")
                    ... on User @include(if: true) { id }
                    nickname @skip(if: false)
                }
            }
            fragment UserFields on User { name }
            "#,
        );
        assert_eq!(doc.fragments().count(), 1);
        assert!(doc.fragment("UserFields").is_some());

        let op = doc.operations().next().unwrap();
        let Selection::Field(user) = &op.selection_set.selections[0] else {
            panic!("expected field");
        };
        let selections = &user.selection_set.as_ref().unwrap().selections;
        assert_eq!(selections.len(), 3);
        assert!(matches!(selections[0], Selection::FragmentSpread(_)));
        assert!(matches!(selections[1], Selection::InlineFragment(_)));
        assert_eq!(selections[0].directives()[0].name.value, "defer");
    }

    #[test]
    fn test_parse_alias_and_keyword_field_names() {
        let doc = parse_ok("{ first: query on type: fragment }");
        let op = doc.operations().next().unwrap();
        let Selection::Field(first) = &op.selection_set.selections[0] else {
            panic!("expected field");
        };
        assert_eq!(first.response_key(), "first");
        assert_eq!(first.name.value, "query");
        assert_eq!(op.selection_set.selections.len(), 3);
    }

    #[test]
    fn test_parse_values() {
        let doc = parse_ok(r#"{ f(a: 1, b: -2.5, c: "x", d: [1, 2], e: {k: RED}, g: null) }"#);
        let op = doc.operations().next().unwrap();
        let Selection::Field(field) = &op.selection_set.selections[0] else {
            panic!("expected field");
        };
        let values: Vec<_> = field.arguments.iter().map(|a| a.value.clone()).collect();
        assert_eq!(values[0], Value::Int(1));
        assert_eq!(values[1], Value::Float(-2.5));
        assert_eq!(values[2], Value::String("x".into()));
        assert_eq!(values[3], Value::List(vec![Value::Int(1), Value::Int(2)]));
        assert!(matches!(&values[4], Value::Object(fields) if fields[0].1 == Value::Enum("RED".into())));
        assert_eq!(values[5], Value::Null);
    }

    #[test]
    fn test_subscription_and_mutation() {
        let doc = parse_ok("mutation { publish(text: \"hi\") } subscription S { tick }");
        let kinds: Vec<_> = doc.operations().map(|op| op.operation).collect();
        assert_eq!(kinds, vec![OperationType::Mutation, OperationType::Subscription]);
    }

    #[test]
    fn test_error_missing_name() {
        assert_eq!(first_error("{ }"), "Syntax Error: Expected Name, found \"}\".");
    }

    #[test]
    fn test_error_unclosed_selection_set() {
        assert_eq!(first_error("{ version"), "Syntax Error: Expected Name, found <EOF>.");
    }

    #[test]
    fn test_error_empty_document() {
        assert_eq!(first_error(""), "Syntax Error: Unexpected <EOF>.");
    }

    #[test]
    fn test_error_unknown_definition() {
        assert_eq!(first_error("type Query { a: Int }"), "Syntax Error: Unexpected Name \"type\".");
    }

    #[test]
    fn test_lex_error_is_reported() {
        assert_eq!(first_error("{ a ? }"), "Syntax Error: Unexpected character: \"?\".");
    }

    #[test]
    fn test_document_locations() {
        let doc = parse_ok("query {\n  user {\n    name\n  }\n}");
        let op = doc.operations().next().unwrap();
        let Selection::Field(user) = &op.selection_set.selections[0] else {
            panic!("expected field");
        };
        let loc = doc.location(user.span);
        assert_eq!((loc.line, loc.column), (2, 3));
    }

    #[test]
    fn test_garbage_terminates() {
        let result = parse("{ a(b: ) } } ) fragment on on { ... }");
        assert!(result.has_errors());
    }

    fn nested(open: &str, close: &str, levels: usize) -> String {
        format!("{}{}", open.repeat(levels), close.repeat(levels))
    }

    #[test]
    fn test_deep_selection_sets_are_rejected() {
        let source = nested("{a", "}", 10_000);
        let result = parse(&source);
        let messages: Vec<_> = result.diagnostics.errors().map(|d| d.client_message()).collect();
        assert_eq!(messages, vec!["Syntax Error: Document nested too deeply."]);
    }

    #[test]
    fn test_deep_values_and_types_are_rejected() {
        let list = format!("{{ a(b: {}) }}", nested("[", "]", 10_000));
        assert_eq!(first_error(&list), "Syntax Error: Document nested too deeply.");

        let object = format!("{{ a(b: {}) }}", nested("{c: ", "}", 10_000));
        assert_eq!(first_error(&object), "Syntax Error: Document nested too deeply.");

        let ty = format!("query ($v: {}) {{ a }}", nested("[", "]", 10_000));
        assert_eq!(first_error(&ty), "Syntax Error: Document nested too deeply.");
    }

    #[test]
    fn test_nesting_at_the_limit_parses() {
        let fields = nested("{a", "}", MAX_NESTING);
        parse_ok(&fields);

        let list = format!("{{ a(b: {}) }}", nested("[", "]", MAX_NESTING - 1));
        parse_ok(&list);

        let too_deep = nested("{a", "}", MAX_NESTING + 1);
        assert!(parse(&too_deep).has_errors());
    }
}
