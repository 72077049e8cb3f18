use keystone_core::Recommendation;
use tracing::warn;

use crate::error::{OrchestratorError, Result};

pub struct MessageParser;

impl MessageParser {
    /// Parses a worker response into a recommendation. The response may wrap
    /// the JSON object in prose or a fenced code block.
    pub fn parse_recommendation(content: &str) -> Result<Recommendation> {
        let json_str = Self::extract_json_from_response(content);

        let recommendation: Recommendation = serde_json::from_str(&json_str).map_err(|e| {
            warn!(
                error = %e,
                content_preview = %content.chars().take(300).collect::<String>(),
                "Failed to parse research recommendation"
            );
            OrchestratorError::MalformedResponse(e.to_string())
        })?;

        if recommendation.recommendation.trim().is_empty() {
            return Err(OrchestratorError::MalformedResponse(
                "recommendation is empty".to_string(),
            ));
        }
        Ok(recommendation)
    }

    pub fn extract_json_from_response(content: &str) -> String {
        for fence in ["```json", "```JSON"] {
            if let Some(start) = content.find(fence) {
                let json_start = start + fence.len();
                if let Some(end) = content[json_start..].find("```") {
                    return content[json_start..json_start + end].trim().to_string();
                }
            }
        }

        if let Some(start) = content.find("```\n{") {
            if let Some(end) = content[start + 4..].find("\n```") {
                return content[start + 4..start + 4 + end].trim().to_string();
            }
        }

        if let Some(start) = content.find('{') {
            if let Some(end) = content.rfind('}') {
                if start < end {
                    return content[start..=end].to_string();
                }
            }
        }

        content.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_core::{CompatibilityNote, Confidence};

    const RESPONSE: &str = r#"{
        "recommendation": "PostgreSQL",
        "version": "16",
        "source": "https://www.postgresql.org/docs/16/",
        "alternatives": ["MySQL", "SQLite"],
        "rationale": "Relational data with strong consistency needs",
        "compatibility_notes": ["Works with every mainstream ORM"],
        "confidence": "HIGH"
    }"#;

    #[test]
    fn test_parse_plain_json() {
        let rec = MessageParser::parse_recommendation(RESPONSE).unwrap();
        assert_eq!(rec.recommendation, "PostgreSQL");
        assert_eq!(rec.confidence, Confidence::High);
        assert_eq!(
            rec.compatibility_notes,
            vec![CompatibilityNote::text("Works with every mainstream ORM")]
        );
    }

    #[test]
    fn test_parse_fenced_json() {
        let content = format!("Here is my finding.\n```json\n{}\n```\nThanks", RESPONSE);
        let rec = MessageParser::parse_recommendation(&content).unwrap();
        assert_eq!(rec.version, "16");
    }

    #[test]
    fn test_missing_field_is_malformed() {
        let content = r#"{"recommendation": "Redis", "confidence": "HIGH"}"#;
        let err = MessageParser::parse_recommendation(content).unwrap_err();
        assert!(matches!(err, OrchestratorError::MalformedResponse(_)));
    }

    #[test]
    fn test_prose_is_malformed() {
        let err = MessageParser::parse_recommendation("I could not find anything useful.")
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::MalformedResponse(_)));
    }

    #[test]
    fn test_blank_recommendation_is_malformed() {
        let content = RESPONSE.replace("\"PostgreSQL\"", "\"  \"");
        assert!(MessageParser::parse_recommendation(&content).is_err());
    }

    #[test]
    fn test_extract_json_raw() {
        let content = "Response: {\"recommendation\": \"Redis\"} done";
        let json = MessageParser::extract_json_from_response(content);
        assert_eq!(json, "{\"recommendation\": \"Redis\"}");
    }
}
