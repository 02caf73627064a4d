//! Retrieved knowledge handed to the SQL generation step. The variants are a
//! closed union so the one place that renders them into prompt context can
//! match exhaustively instead of probing loose fields.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KnowledgeItem {
    /// A business metric and how it is computed.
    Metric {
        name: String,
        definition: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
    },
    /// A standing rule the generated SQL must respect.
    Rule { description: String },
    /// A question/SQL pair a human has verified.
    VerifiedQuery { question: String, sql: String },
    /// A past failure and the SQL that fixed it.
    Learning { error: String, corrected_sql: String },
}

/// Renders retrieved knowledge into the context block of a generation
/// prompt. This is the only place the union is unpacked.
pub fn render_context(items: &[KnowledgeItem]) -> String {
    if items.is_empty() {
        return String::new();
    }

    let mut out = String::from("Context from the knowledge base:\n");
    for item in items {
        match item {
            KnowledgeItem::Metric {
                name,
                definition,
                unit,
            } => {
                out.push_str(&format!("- metric '{name}': {definition}"));
                if let Some(unit) = unit {
                    out.push_str(&format!(" (unit: {unit})"));
                }
                out.push('\n');
            }
            KnowledgeItem::Rule { description } => {
                out.push_str(&format!("- rule: {description}\n"));
            }
            KnowledgeItem::VerifiedQuery { question, sql } => {
                out.push_str(&format!("- verified query for \"{question}\": {sql}\n"));
            }
            KnowledgeItem::Learning {
                error,
                corrected_sql,
            } => {
                out.push_str(&format!(
                    "- a previous query failed with \"{error}\" and was fixed as: {corrected_sql}\n"
                ));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn renders_every_variant() {
        let items = vec![
            KnowledgeItem::Metric {
                name: "mrr".into(),
                definition: "sum of active subscription amounts".into(),
                unit: Some("usd".into()),
            },
            KnowledgeItem::Rule {
                description: "exclude test accounts".into(),
            },
            KnowledgeItem::VerifiedQuery {
                question: "how many orders".into(),
                sql: "SELECT COUNT(*) FROM orders".into(),
            },
            KnowledgeItem::Learning {
                error: "column \"amt\" does not exist".into(),
                corrected_sql: "SELECT amount FROM orders".into(),
            },
        ];

        let rendered = render_context(&items);
        assert!(rendered.contains("metric 'mrr'"));
        assert!(rendered.contains("unit: usd"));
        assert!(rendered.contains("exclude test accounts"));
        assert!(rendered.contains("verified query"));
        assert!(rendered.contains("was fixed as"));
    }

    #[test]
    fn empty_knowledge_renders_nothing() {
        assert_eq!(render_context(&[]), "");
    }

    #[test]
    fn round_trips_through_serde_with_kind_tags() {
        let raw = r#"[{"kind":"rule","description":"no PII"}]"#;
        let items: Vec<KnowledgeItem> = serde_json::from_str(raw).expect("should deserialize");
        assert!(matches!(items[0], KnowledgeItem::Rule { .. }));
    }
}
