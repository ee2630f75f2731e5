//! Text-level tool-call extraction for models without native tool calling.
//!
//! The grammar is `ToolName(arg1, arg2, ...)` where arguments may contain
//! nested `[]`, `()`, `{}` and quoted strings.

use serde_json::{Map, Value};

use relay_core::types::{ToolCall, ToolDefinition};

/// Scanner state shared by argument splitting and close-paren search.
#[derive(Default)]
struct Nesting {
    depth: usize,
    quote: Option<char>,
}

impl Nesting {
    /// Advance over `c`. Returns true when `c` is structural at depth zero.
    fn step(&mut self, c: char) -> bool {
        if let Some(q) = self.quote {
            if c == q {
                self.quote = None;
            }
            return false;
        }
        match c {
            '"' | '\'' => {
                self.quote = Some(c);
                false
            }
            '(' | '[' | '{' => {
                self.depth += 1;
                false
            }
            ')' | ']' | '}' if self.depth > 0 => {
                self.depth -= 1;
                false
            }
            _ => self.depth == 0,
        }
    }
}

/// Split on top-level commas. Parts are trimmed and empty parts dropped.
pub fn split_arguments(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut nesting = Nesting::default();

    for c in text.chars() {
        if nesting.step(c) && c == ',' {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);

    parts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Byte offset of the `)` closing a call whose arguments start at `text[0]`.
fn find_close_paren(text: &str) -> Option<usize> {
    let mut nesting = Nesting::default();
    for (i, c) in text.char_indices() {
        if c == ')' && nesting.quote.is_none() && nesting.depth == 0 {
            return Some(i);
        }
        nesting.step(c);
    }
    None
}

fn strip_quotes(arg: &str) -> &str {
    let trimmed = arg.trim();
    for q in ['"', '\''] {
        if trimmed.len() >= 2 && trimmed.starts_with(q) && trimmed.ends_with(q) {
            return &trimmed[1..trimmed.len() - 1];
        }
    }
    trimmed
}

/// Positional parameter names from a JSON schema: `required` first, then the
/// remaining `properties`.
fn parameter_names(schema: &Value) -> Vec<String> {
    let mut names: Vec<String> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();
    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for key in props.keys() {
            if !names.contains(key) {
                names.push(key.clone());
            }
        }
    }
    names
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Every `Tool(...)` call of a known tool in `text`, in reading order.
pub fn parse_tool_calls(text: &str, tools: &[ToolDefinition]) -> Vec<ToolCall> {
    let mut calls = Vec::new();

    for line in text.lines() {
        let mut found: Vec<(usize, &ToolDefinition)> = Vec::new();
        for tool in tools {
            let needle = format!("{}(", tool.name);
            for (pos, _) in line.match_indices(&needle) {
                let boundary = line[..pos].chars().next_back().map_or(true, |c| !is_ident_char(c));
                if boundary {
                    found.push((pos, tool));
                }
            }
        }
        found.sort_by_key(|(pos, _)| *pos);

        for (pos, tool) in found {
            let args_start = pos + tool.name.len() + 1;
            let Some(len) = find_close_paren(&line[args_start..]) else {
                continue;
            };
            let raw = &line[args_start..args_start + len];

            let names = parameter_names(&tool.input_schema);
            let mut arguments = Map::new();
            for (i, part) in split_arguments(raw).iter().enumerate() {
                let key = names.get(i).cloned().unwrap_or_else(|| format!("arg{i}"));
                arguments.insert(key, Value::String(strip_quotes(part).to_string()));
            }

            calls.push(ToolCall {
                id: format!("{}_{}", tool.name, calls.len()),
                name: tool.name.clone(),
                arguments,
            });
        }
    }

    calls
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str, schema: Value) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            description: String::new(),
            input_schema: schema,
        }
    }

    #[test]
    fn split_respects_nesting_and_quotes() {
        assert_eq!(
            split_arguments(r#"a, [1, 2], {"k": "x,y"}, f(3, 4), 'p, q'"#),
            vec!["a", "[1, 2]", r#"{"k": "x,y"}"#, "f(3, 4)", "'p, q'"]
        );
        assert_eq!(split_arguments(" , x ,, "), vec!["x"]);
        assert!(split_arguments("").is_empty());
    }

    #[test]
    fn parses_calls_with_schema_names() {
        let tools = vec![tool(
            "GetWeather",
            json!({
                "type": "object",
                "properties": {"city": {}, "units": {}},
                "required": ["city"]
            }),
        )];
        let calls = parse_tool_calls("Let me check.\nGetWeather(\"Hà Nội\", metric, extra)\n", &tools);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "GetWeather_0");
        assert_eq!(calls[0].arguments["city"], "Hà Nội");
        assert_eq!(calls[0].arguments["units"], "metric");
        assert_eq!(calls[0].arguments["arg2"], "extra");
    }

    #[test]
    fn nested_parens_and_ordering() {
        let tools = vec![tool("Calc", json!({})), tool("Echo", json!({}))];
        let calls = parse_tool_calls("Echo(hi) then Calc((1 + 2) * 3, \")\")", &tools);
        let names: Vec<_> = calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Echo", "Calc"]);
        assert_eq!(calls[1].arguments["arg0"], "(1 + 2) * 3");
        assert_eq!(calls[1].arguments["arg1"], ")");
        assert_eq!(calls[1].id, "Calc_1");
    }

    #[test]
    fn ignores_unknown_unclosed_and_embedded_names() {
        let tools = vec![tool("Calc", json!({}))];
        assert!(parse_tool_calls("Other(1)\nCalc(1, 2", &tools).is_empty());
        assert!(parse_tool_calls("MyCalc(1)", &tools).is_empty());
        let calls = parse_tool_calls("Calc()", &tools);
        assert_eq!(calls.len(), 1);
        assert!(calls[0].arguments.is_empty());
    }
}
