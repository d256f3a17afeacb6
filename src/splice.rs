//! Reassemble console output with the rich tool results it refers to.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::bridge::ToolOutput;
use crate::content::ComplexContent;

static MARKER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<<TOOL_RESPONSE:([^>]+)>>").unwrap());

/// Text shown where a marker has no stored response.
pub fn missing_response_text(call_id: &str) -> String {
    format!("((Tool response with ID {call_id} not found.))")
}

/// Split `output` on tool-response markers and substitute each with its stored content.
///
/// Empty text segments are dropped; everything else keeps its order.
pub fn splice(output: &str, responses: &HashMap<String, ToolOutput>) -> Vec<ComplexContent> {
    let mut content = Vec::new();
    let mut last = 0;

    for captures in MARKER_PATTERN.captures_iter(output) {
        let (Some(whole), Some(id)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        push_text(&mut content, &output[last..whole.start()]);
        match responses.get(id.as_str()) {
            Some(found) => content.extend(found.content.iter().cloned()),
            None => {
                tracing::warn!(call_id = %id.as_str(), "No stored response for tool marker");
                content.push(ComplexContent::text(missing_response_text(id.as_str())));
            }
        }
        last = whole.end();
    }
    push_text(&mut content, &output[last..]);

    content
}

fn push_text(content: &mut Vec<ComplexContent>, text: &str) {
    if !text.is_empty() {
        content.push(ComplexContent::text(text));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(entries: &[(&str, Vec<ComplexContent>)]) -> HashMap<String, ToolOutput> {
        entries
            .iter()
            .map(|(id, content)| {
                (
                    id.to_string(),
                    ToolOutput {
                        tool_name: "t".to_string(),
                        content: content.clone(),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn plain_output_is_one_text_block() {
        assert_eq!(splice("hello\n", &HashMap::new()), vec![ComplexContent::text("hello\n")]);
        assert!(splice("", &HashMap::new()).is_empty());
    }

    #[test]
    fn marker_is_replaced_in_place() {
        let responses = registry(&[("abc", vec![ComplexContent::text("12:00")])]);
        let spliced = splice("The time is <<TOOL_RESPONSE:abc>>\n", &responses);
        assert_eq!(
            spliced,
            vec![
                ComplexContent::text("The time is "),
                ComplexContent::text("12:00"),
                ComplexContent::text("\n"),
            ]
        );
    }

    #[test]
    fn image_content_survives_and_marker_never_leaks() {
        let image = ComplexContent::Image {
            data: "iVBORw==".to_string(),
            media_type: "image/png".to_string(),
        };
        let responses = registry(&[("a", vec![image.clone()]), ("b", vec![ComplexContent::text("x")])]);
        let spliced = splice("<<TOOL_RESPONSE:a>><<TOOL_RESPONSE:b>>", &responses);

        assert_eq!(spliced, vec![image, ComplexContent::text("x")]);
        assert!(!crate::content::extract_all_text(&spliced).contains("TOOL_RESPONSE"));
    }

    #[test]
    fn missing_id_becomes_visible_placeholder() {
        let spliced = splice("before <<TOOL_RESPONSE:gone>> after", &HashMap::new());
        assert_eq!(
            spliced,
            vec![
                ComplexContent::text("before "),
                ComplexContent::text("((Tool response with ID gone not found.))"),
                ComplexContent::text(" after"),
            ]
        );
    }
}
