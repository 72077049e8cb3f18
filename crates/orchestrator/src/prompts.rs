use keystone_core::{OpportunityId, ResearchContext};

pub struct ResearchPrompts;

impl ResearchPrompts {
    /// The exact prompt recorded on the execution row and sent to the worker.
    pub fn opportunity(
        context: &ResearchContext,
        opportunity: OpportunityId,
        follow_up: Option<&str>,
    ) -> String {
        let entry = opportunity.entry();
        let mut prompt = format!(
            r#"You are researching one technology decision for a software project.

## Project
**Type:** {project_type}
**Complexity:** {complexity:?}
{facts}{constraints}{explicit}
## Research Question
**Opportunity:** {id} ({name})
{question}
"#,
            project_type = context.project_type,
            complexity = context.complexity,
            facts = bullet_section("Known Facts", &context.known_facts),
            constraints = bullet_section("Constraints", &context.constraints),
            explicit = bullet_section(
                "Mandated Technologies",
                &context
                    .explicit_requirements
                    .iter()
                    .map(|r| match &r.version {
                        Some(v) => format!("{}: {} {}", r.category, r.technology, v),
                        None => format!("{}: {}", r.category, r.technology),
                    })
                    .collect::<Vec<_>>(),
            ),
            id = entry.id,
            name = entry.name,
            question = entry.research_question,
        );

        if let Some(follow_up) = follow_up {
            prompt.push_str(&format!(
                "\n## Follow-up\nA previous recommendation for this question was rejected during reconciliation:\n{}\nRecommend a technology that resolves this.\n",
                follow_up
            ));
        }

        prompt.push_str(
            r#"
## Required Output
Respond with a single JSON object:
```json
{
  "recommendation": "technology name",
  "version": "current stable version",
  "source": "https://authoritative-source",
  "alternatives": ["..."],
  "rationale": "why it fits this project",
  "compatibility_notes": [
    {"relation": "requires|incompatible_with|compatible_with", "technology": "...", "category": "database"},
    "free-text note"
  ],
  "confidence": "HIGH|MEDIUM|LOW"
}
```"#,
        );
        prompt
    }
}

fn bullet_section(title: &str, items: &[String]) -> String {
    if items.is_empty() {
        return String::new();
    }
    let mut section = format!("\n## {}\n", title);
    for item in items {
        section.push_str(&format!("- {}\n", item));
    }
    section
}
