use super::retriever::Evidence;

/// Format evidence as labeled context blocks for prompt injection.
/// Chunk text is included verbatim.
pub fn format_context_with_citations(evidence: &[Evidence]) -> String {
    let mut output = String::new();
    for (i, item) in evidence.iter().enumerate() {
        if i > 0 {
            output.push_str("\n\n---\n\n");
        }
        output.push_str(&format!(
            "[doc_id={} | category={} | source={}]\n",
            item.document_id, item.category, item.source_url,
        ));
        output.push_str(&item.text);
    }
    output
}

/// User turn: the context blocks followed by the question.
pub fn build_user_prompt(question: &str, evidence: &[Evidence]) -> String {
    format!(
        "Context:\n{}\n\nQuestion: {}\n\nAnswer:",
        format_context_with_citations(evidence),
        question.trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::Category;

    fn evidence(id: &str, url: &str, text: &str) -> Evidence {
        Evidence {
            chunk_id: format!("{id}_chunk_0"),
            similarity_score: 0.9,
            source_url: url.into(),
            text: text.into(),
            document_id: id.into(),
            category: Category::AcademicPrograms,
        }
    }

    #[test]
    fn test_single_block() {
        let out = format_context_with_citations(&[evidence("d1", "https://aims-cameroon.org/msc", "One-year MSc.")]);
        assert_eq!(
            out,
            "[doc_id=d1 | category=academic-programs | source=https://aims-cameroon.org/msc]\nOne-year MSc."
        );
    }

    #[test]
    fn test_multiple_blocks_separated() {
        let out = format_context_with_citations(&[
            evidence("a", "https://x.org/a", "First chunk"),
            evidence("b", "https://x.org/b", "Second chunk"),
        ]);
        assert_eq!(out.matches("---").count(), 1);
        assert!(out.find("First chunk").unwrap() < out.find("Second chunk").unwrap());
    }

    #[test]
    fn test_user_prompt_includes_question() {
        let prompt = build_user_prompt("  What is offered? ", &[evidence("a", "https://x.org/a", "MSc")]);
        assert!(prompt.starts_with("Context:\n[doc_id=a"));
        assert!(prompt.contains("Question: What is offered?\n"));
        assert!(prompt.ends_with("Answer:"));
    }
}
