use std::fmt::Write;

use relay_core::types::ToolResult;

/// Render tool results as the text block fed back to the calling agent.
///
/// Each output is capped at `max_per_tool` characters. Once adding the next
/// entry would push the block past `max_total` characters, that entry and all
/// later ones are listed by name and status only. The first entry is always
/// rendered in full. A limit of zero disables it.
pub fn format_tool_results(results: &[ToolResult], max_per_tool: usize, max_total: usize) -> String {
    let mut out = String::from("\n[TOOL EXECUTION RESULTS]\n\n");
    let mut total = 0usize;

    for (i, result) in results.iter().enumerate() {
        let output = truncate_output(&result.output, max_per_tool);
        let entry = format!(
            "{}:\n  Status: {}\n  Output: {}\n\n",
            result.tool_name,
            result.status.as_str(),
            output
        );
        let entry_chars = entry.chars().count();

        if i > 0 && max_total > 0 && total + entry_chars > max_total {
            let rest = &results[i..];
            let _ = writeln!(
                out,
                "[{} additional tool(s) summarized to save context - total output limit: {} chars]",
                rest.len(),
                max_total
            );
            for r in rest {
                let _ = writeln!(out, "  - {}: {} (output omitted)", r.tool_name, r.status.as_str());
            }
            out.push('\n');
            break;
        }

        total += entry_chars;
        out.push_str(&entry);
    }

    out.push_str("[END RESULTS]\n");
    out
}

/// Cap `output` at `max_chars` characters, noting the original size.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    let len = output.chars().count();
    if max_chars == 0 || len <= max_chars {
        return output.to_string();
    }
    let head: String = output.chars().take(max_chars).collect();
    format!("{head}\n\n[OUTPUT TRUNCATED - Original size: {len} characters]")
}
