//! Dolly prompt template

use super::{DollyRecord, TextSample};

const SECTION_SEPARATOR: &str = "\n\n";

/// Render a record as a single training text
///
/// Sections appear in the order instruction, context, answer, separated by
/// one blank line. The context section is present only when the context is
/// non-empty; whitespace counts as content.
pub fn format_dolly(record: &DollyRecord) -> TextSample {
    let instruction = format!("### Instruction\n{}", record.instruction);
    let context =
        (!record.context.is_empty()).then(|| format!("### Context\n{}", record.context));
    let response = format!("### Answer\n{}", record.response);

    let text = [Some(instruction), context, Some(response)]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(SECTION_SEPARATOR);

    TextSample { text }
}
