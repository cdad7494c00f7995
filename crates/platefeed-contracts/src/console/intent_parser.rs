use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, NO_ARG_COMMANDS, RAW_ARG_COMMANDS, SINGLE_PATH_COMMANDS,
};

/// One parsed line of console input. Bare text (no leading slash) stages
/// its content as the pending car identifier, matching how the phone app
/// treats the free-text field.
#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            command_args: BTreeMap::new(),
        }
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn parse_single_path_arg(arg: &str) -> String {
    if arg.trim().is_empty() {
        return String::new();
    }
    let parts: Vec<String> = match shell_words::split(arg) {
        Ok(parts) => parts.into_iter().filter(|value| !value.is_empty()).collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    };
    match parts.len() {
        0 => String::new(),
        1 => parts[0].clone(),
        _ => parts.join(" "),
    }
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let remainder = &slash_tail[command_len..];
            let arg = if remainder.is_empty() {
                ""
            } else {
                remainder.trim()
            };

            if let Some(action) = find_action(&command, RAW_ARG_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent
                    .command_args
                    .insert("plate".to_string(), Value::String(arg.to_string()));
                return intent;
            }

            if let Some(action) = find_action(&command, SINGLE_PATH_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent.command_args.insert(
                    "path".to_string(),
                    Value::String(parse_single_path_arg(arg)),
                );
                return intent;
            }

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return Intent::new(action, text);
            }

            let mut intent = Intent::new("unknown", text);
            intent
                .command_args
                .insert("command".to_string(), Value::String(command));
            intent
                .command_args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return intent;
        }
    }

    let mut intent = Intent::new("stage_plate", text);
    intent.command_args.insert(
        "plate".to_string(),
        Value::String(raw_trimmed.to_string()),
    );
    intent
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_intent;

    #[test]
    fn parse_attach_quoted_path() {
        let intent = parse_intent("/attach \"/tmp/car photo.jpg\"");
        assert_eq!(intent.action, "stage_image");
        assert_eq!(intent.command_args["path"], json!("/tmp/car photo.jpg"));
    }

    #[test]
    fn parse_plate_raw_arg() {
        let intent = parse_intent("/plate CAR12345");
        assert_eq!(intent.action, "stage_plate");
        assert_eq!(intent.command_args["plate"], json!("CAR12345"));
    }

    #[test]
    fn parse_no_arg_commands() {
        assert_eq!(parse_intent("/send").action, "submit_image");
        assert_eq!(parse_intent("/report").action, "submit_plate");
        assert_eq!(parse_intent("/feed").action, "show_feed");
        assert_eq!(parse_intent("/status").action, "show_status");
        assert_eq!(parse_intent("/discard").action, "discard_image");
        assert_eq!(parse_intent("/connect").action, "connect");
        assert_eq!(parse_intent("/disconnect").action, "disconnect");
        assert_eq!(parse_intent("/quit").action, "quit");
    }

    #[test]
    fn bare_text_stages_plate() {
        let intent = parse_intent("  XYZ1  ");
        assert_eq!(intent.action, "stage_plate");
        assert_eq!(intent.command_args["plate"], json!("XYZ1"));
    }

    #[test]
    fn parse_unknown_command() {
        let intent = parse_intent("/magic foo bar");
        assert_eq!(intent.action, "unknown");
        assert_eq!(intent.command_args["command"], json!("magic"));
        assert_eq!(intent.command_args["arg"], json!("foo bar"));
    }

    #[test]
    fn blank_input_is_noop() {
        assert_eq!(parse_intent("   ").action, "noop");
        assert_eq!(parse_intent("").action, "noop");
    }

    #[test]
    fn command_casing_is_normalized() {
        assert_eq!(parse_intent("/SEND").action, "submit_image");
        assert_eq!(parse_intent("/Plate abc").action, "stage_plate");
    }
}
