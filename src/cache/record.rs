//! Canonical ID extraction from serialized record content.
//!
//! Records are JSON objects whose top-level `ID` member is either a string or a
//! non-negative integer. Exactly one `ID` member is accepted.

use serde::Deserialize;

use super::traits::IdRule;
use crate::error::ParseError;

#[derive(Deserialize)]
struct IdEnvelope {
  #[serde(rename = "ID")]
  id: Option<RawId>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
  Text(String),
  Number(u64),
}

/// Extract the record's ID, checked against `rule` and returned in canonical form.
pub fn parse_id(content: &str, rule: IdRule) -> Result<String, ParseError> {
  if !content.trim_start().starts_with('{') {
    return Err(ParseError::Malformed(
      "record content is not a JSON object".to_string(),
    ));
  }

  let envelope: IdEnvelope = serde_json::from_str(content).map_err(|e| {
    // serde reports a repeated `ID` as a duplicate field; the record is ambiguous either way
    ParseError::Malformed(e.to_string())
  })?;

  let id = match envelope.id.ok_or(ParseError::MissingId)? {
    RawId::Text(text) => text.trim().to_string(),
    RawId::Number(number) => number.to_string(),
  };

  if id.is_empty() {
    return Err(ParseError::EmptyId);
  }
  rule.canonical(&id).ok_or(ParseError::InvalidId(id))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse(content: &str) -> Result<String, ParseError> {
    parse_id(content, IdRule::default())
  }

  #[test]
  fn test_parses_string_and_numeric_ids() {
    assert_eq!(parse(r#"{"ID":"42","Name":"Ann"}"#), Ok("42".to_string()));
    assert_eq!(parse(r#"{"Name":"Ann","ID":7}"#), Ok("7".to_string()));
  }

  #[test]
  fn test_id_is_canonicalized() {
    assert_eq!(parse(r#"{"ID":"007"}"#), Ok("7".to_string()));
    assert_eq!(parse(r#"{"ID":" +12 "}"#), Ok("12".to_string()));
  }

  #[test]
  fn test_missing_id() {
    assert_eq!(parse(r#"{"Name":"Ann"}"#), Err(ParseError::MissingId));
    assert_eq!(parse(r#"{"ID":null}"#), Err(ParseError::MissingId));
  }

  #[test]
  fn test_empty_id() {
    assert_eq!(parse(r#"{"ID":"  "}"#), Err(ParseError::EmptyId));
  }

  #[test]
  fn test_invalid_id() {
    assert_eq!(
      parse(r#"{"ID":"abc"}"#),
      Err(ParseError::InvalidId("abc".to_string()))
    );
    assert!(matches!(parse(r#"{"ID":-3}"#), Err(ParseError::Malformed(_))));
  }

  #[test]
  fn test_duplicate_id_is_malformed() {
    assert!(matches!(
      parse(r#"{"ID":"1","ID":"2"}"#),
      Err(ParseError::Malformed(_))
    ));
  }

  #[test]
  fn test_non_object_is_malformed() {
    assert!(matches!(parse("<Student ID=\"1\"/>"), Err(ParseError::Malformed(_))));
    assert!(matches!(parse("[1]"), Err(ParseError::Malformed(_))));
  }
}
