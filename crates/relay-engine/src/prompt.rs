use std::fmt::Write;

use relay_core::config::AgentConfig;
use relay_core::types::ToolDefinition;

/// System prompt for an agent: its template with variables substituted, or a
/// generated prompt listing the agent's tools.
pub fn build_system_prompt(agent: &AgentConfig, tools: &[ToolDefinition]) -> String {
    match agent.system_prompt.as_deref() {
        Some(template) if !template.trim().is_empty() => render_template(agent, template),
        _ => generic_prompt(agent, tools),
    }
}

/// Substitute `{{name}}`, `{{role}}`, `{{description}}` and `{{backstory}}`.
pub fn render_template(agent: &AgentConfig, template: &str) -> String {
    let name = agent.display_name();
    template
        .replace("{{name}}", name)
        .replace("{{role}}", &agent.role)
        .replace("{{description}}", &format!("{} - {}", name, agent.role))
        .replace("{{backstory}}", &agent.backstory)
}

pub fn generic_prompt(agent: &AgentConfig, tools: &[ToolDefinition]) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "You are {}.", agent.display_name());
    if !agent.role.is_empty() {
        let _ = writeln!(prompt, "Role: {}", agent.role);
    }
    if !agent.backstory.is_empty() {
        let _ = writeln!(prompt, "Backstory: {}", agent.backstory);
    }
    prompt.push('\n');

    if !tools.is_empty() {
        prompt.push_str("You have access to the following tools:\n");
        for (i, tool) in tools.iter().enumerate() {
            let _ = writeln!(prompt, "{}. {}: {}", i + 1, tool.name, tool.description);
        }
        prompt.push_str(
            "\nWhen you need a tool, write the call on its own line exactly like this:\nToolName(arg1, arg2)\n\n",
        );
    }

    prompt.push_str("Instructions:\n");
    prompt.push_str("1. Analyze the input and decide whether you need a tool\n");
    prompt.push_str("2. Use tools to gather information\n");
    prompt.push_str("3. Use the tool results to give a clear answer\n");

    if agent.is_terminal {
        prompt.push_str("\nYou are the final agent in this workflow. Give a complete answer.\n");
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::config::ModelConfig;

    fn agent() -> AgentConfig {
        let mut a = AgentConfig::new("tutor", ModelConfig::new("openai", "m"));
        a.name = "Tutor".into();
        a.role = "Math teacher".into();
        a.backstory = "Patient and precise".into();
        a
    }

    #[test]
    fn template_substitution() {
        let mut a = agent();
        a.system_prompt = Some("I am {{name}}, {{description}}. {{backstory}}. {{name}}!".into());
        assert_eq!(
            build_system_prompt(&a, &[]),
            "I am Tutor, Tutor - Math teacher. Patient and precise. Tutor!"
        );
    }

    #[test]
    fn generic_prompt_lists_tools() {
        let mut a = agent();
        a.is_terminal = true;
        let tools = vec![ToolDefinition {
            name: "Calc".into(),
            description: "Evaluate an expression".into(),
            input_schema: serde_json::json!({}),
        }];
        let prompt = build_system_prompt(&a, &tools);
        assert!(prompt.starts_with("You are Tutor.\nRole: Math teacher\n"));
        assert!(prompt.contains("1. Calc: Evaluate an expression"));
        assert!(prompt.contains("ToolName(arg1, arg2)"));
        assert!(prompt.contains("final agent"));
    }

    #[test]
    fn blank_template_falls_back() {
        let mut a = agent();
        a.system_prompt = Some("   ".into());
        assert!(build_system_prompt(&a, &[]).starts_with("You are Tutor."));
        assert!(!build_system_prompt(&a, &[]).contains("ToolName"));
    }
}
