//! SQL identifier validation and quoting.
//!
//! Every identifier that ends up in generated SQL (table, view, column, constraint names) goes
//! through this module:
//!
//! ```text
//! descriptor / header cell → validate_identifier() → quote_identifier() → SQL text
//!                            (allow-list + sqlparser)  (pg_escape quoting)
//! ```
//!
//! Values are bound as query parameters wherever PostgreSQL allows it. Literals that must be
//! spliced into DDL (view bodies) go through [`literal`].

use std::borrow::Cow;

use sqlparser::{
    dialect::PostgreSqlDialect,
    tokenizer::{Token, Tokenizer},
};

/// PostgreSQL truncates identifiers longer than this many bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Errors that occur during SQL identifier validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidateIdentifierError {
    /// Identifier is empty
    #[error("identifier cannot be empty")]
    Empty,

    /// Identifier exceeds PostgreSQL's 63-byte limit
    #[error("identifier '{name}' exceeds PostgreSQL limit of 63 bytes (got {length})")]
    TooLong { name: String, length: usize },

    /// Identifier contains a character outside `[A-Za-z0-9_]`
    #[error("identifier '{name}' contains invalid character: '{character}'")]
    InvalidCharacter { name: String, character: char },

    /// Identifier must start with a letter or underscore
    #[error("identifier '{name}' must start with a letter or underscore, got '{first_char}'")]
    InvalidFirstCharacter { name: String, first_char: char },

    /// Identifier failed SQL tokenization
    #[error("'{name}' is not a valid SQL identifier: {reason}")]
    TokenizerError { name: String, reason: String },

    /// Identifier does not tokenize as exactly one unquoted word
    #[error("identifier '{name}' is not a single SQL word")]
    NotASingleWord { name: String },
}

/// Validate that a string is a simple, unqualified PostgreSQL identifier.
///
/// Accepts ASCII letters, digits and `_`, not starting with a digit, at most
/// [`MAX_IDENTIFIER_LEN`] bytes, and tokenized by sqlparser as one unquoted word.
///
/// Keywords are accepted: [`ident`] quotes them, so `order` or `table` work as column names.
pub fn validate_identifier(name: &str) -> Result<(), ValidateIdentifierError> {
    let Some(first_char) = name.chars().next() else {
        return Err(ValidateIdentifierError::Empty);
    };

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(ValidateIdentifierError::TooLong {
            name: name.to_string(),
            length: name.len(),
        });
    }

    if let Some(character) = name
        .chars()
        .find(|ch| !ch.is_ascii_alphanumeric() && *ch != '_')
    {
        return Err(ValidateIdentifierError::InvalidCharacter {
            name: name.to_string(),
            character,
        });
    }

    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(ValidateIdentifierError::InvalidFirstCharacter {
            name: name.to_string(),
            first_char,
        });
    }

    let tokens = Tokenizer::new(&PostgreSqlDialect {}, name)
        .tokenize()
        .map_err(|err| ValidateIdentifierError::TokenizerError {
            name: name.to_string(),
            reason: err.to_string(),
        })?;
    match tokens.as_slice() {
        [Token::Word(word)] if word.quote_style.is_none() && word.value == name => Ok(()),
        _ => Err(ValidateIdentifierError::NotASingleWord {
            name: name.to_string(),
        }),
    }
}

/// Quote an identifier for splicing into SQL text.
///
/// Assumes `name` passed [`validate_identifier`]. Quotes only when PostgreSQL requires it
/// (keywords, upper-case letters).
pub fn ident(name: &str) -> Cow<'_, str> {
    pg_escape::quote_identifier(name)
}

/// Quote a string literal for splicing into DDL text.
pub fn literal(value: &str) -> String {
    pg_escape::quote_literal(value)
}

/// Join quoted identifiers with `, `.
pub fn ident_list<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    names.into_iter().map(ident).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_identifier_accepts_simple_names() {
        for name in ["users", "user_accounts", "_hidden", "Courses2024"] {
            assert!(
                validate_identifier(name).is_ok(),
                "'{name}' should be a valid identifier"
            );
        }
    }

    #[test]
    fn validate_identifier_rejects_injection_attempts() {
        //* When
        let result = validate_identifier("users; DROP TABLE students");

        //* Then
        assert!(matches!(
            result,
            Err(ValidateIdentifierError::InvalidCharacter { character: ';', .. })
        ));
    }

    #[test]
    fn validate_identifier_rejects_qualified_and_dollar_names() {
        assert!(matches!(
            validate_identifier("public.users"),
            Err(ValidateIdentifierError::InvalidCharacter { character: '.', .. })
        ));
        assert!(matches!(
            validate_identifier("price$"),
            Err(ValidateIdentifierError::InvalidCharacter { character: '$', .. })
        ));
    }

    #[test]
    fn validate_identifier_rejects_leading_digit() {
        assert!(matches!(
            validate_identifier("1table"),
            Err(ValidateIdentifierError::InvalidFirstCharacter { first_char: '1', .. })
        ));
    }

    #[test]
    fn validate_identifier_rejects_empty_and_long_names() {
        assert_eq!(validate_identifier(""), Err(ValidateIdentifierError::Empty));

        let long = "a".repeat(64);
        assert!(matches!(
            validate_identifier(&long),
            Err(ValidateIdentifierError::TooLong { length: 64, .. })
        ));
        assert!(validate_identifier(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn validate_identifier_accepts_every_keyword_and_ident_quotes_it() {
        for name in ["table", "order", "user", "select"] {
            //* When
            let result = validate_identifier(name);

            //* Then
            assert_eq!(result, Ok(()), "'{name}' should be accepted");
            assert_eq!(ident(name), format!("\"{name}\""));
        }
    }

    #[test]
    fn ident_quotes_reserved_words_and_mixed_case() {
        assert_eq!(ident("users"), "users");
        assert_eq!(ident("select"), "\"select\"");
        assert_eq!(ident("Courses"), "\"Courses\"");
    }

    #[test]
    fn literal_escapes_single_quotes() {
        assert_eq!(literal("it's"), "'it''s'");
    }
}
