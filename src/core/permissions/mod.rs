use serde_json::Value;
use std::collections::HashSet;

/// First command token → integration id. The CLI name usually matches the
/// integration id, but not always (the `x` CLI fronts the twitter integration).
const CLI_INTEGRATIONS: &[(&str, &str)] = &[
    ("gmail", "gmail"),
    ("gcal", "gcal"),
    ("slack", "slack"),
    ("x", "twitter"),
    ("hubspot", "hubspot"),
    ("salesforce", "salesforce"),
];

/// Integrations whose CLI uses the `<cli> <resource> <action>` grammar.
const RESOURCE_SCOPED: &[&str] = &["hubspot", "salesforce"];

/// Resource names that are flat operations rather than `resource.action`.
const FLAT_RESOURCES: &[&str] = &["owners", "search"];

/// Read (auto-executable) operations per integration.
const READ_OPS: &[(&str, &[&str])] = &[
    ("gmail", &["list", "read", "search", "thread", "labels", "drafts"]),
    ("gcal", &["list", "show", "freebusy", "calendars"]),
    ("slack", &["channels", "history", "read", "search", "users"]),
    ("twitter", &["timeline", "search", "read", "profile"]),
];

/// Write (approval-gated) operations per integration.
const WRITE_OPS: &[(&str, &[&str])] = &[
    (
        "gmail",
        &["send", "reply", "forward", "draft", "archive", "trash", "label"],
    ),
    ("gcal", &["create", "update", "delete", "respond"]),
    ("slack", &["send", "react", "upload", "join", "leave"]),
    (
        "twitter",
        &["post", "reply", "repost", "like", "follow", "dm"],
    ),
];

/// Action verbs for resource-scoped integrations (`contacts.update` etc).
const RESOURCE_READ_ACTIONS: &[&str] = &["get", "list", "search"];
const RESOURCE_WRITE_ACTIONS: &[&str] = &["create", "update", "delete", "associate", "merge"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub integration: String,
    pub operation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
}

/// Unknown-operation policy, surfaced in steward.toml. The permissive default
/// matches the historical behavior: unrecognized verbs on a credentialed
/// integration execute without approval.
#[derive(Debug, Clone, Copy)]
pub struct PermissionPolicy {
    pub allow_unknown_operations: bool,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self {
            allow_unknown_operations: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionResult {
    pub allowed: bool,
    pub needs_approval: bool,
    pub needs_auth: bool,
    pub integration: Option<String>,
    pub reason: Option<String>,
}

impl PermissionResult {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            needs_approval: false,
            needs_auth: false,
            integration: None,
            reason: None,
        }
    }

    fn approval(integration: &str, reason: String) -> Self {
        Self {
            allowed: false,
            needs_approval: true,
            needs_auth: false,
            integration: Some(integration.to_string()),
            reason: Some(reason),
        }
    }

    fn auth(integration: &str, reason: String) -> Self {
        Self {
            allowed: false,
            needs_approval: false,
            needs_auth: true,
            integration: Some(integration.to_string()),
            reason: Some(reason),
        }
    }
}

fn integration_for_cli(cli: &str) -> Option<&'static str> {
    CLI_INTEGRATIONS
        .iter()
        .find(|(name, _)| *name == cli)
        .map(|(_, id)| *id)
}

/// Parse a shell command into its integration and operation. Returns `None`
/// when the first token is not a known integration CLI; such commands are
/// ordinary shell usage and bypass the gate entirely.
pub fn parse_command(command: &str) -> Option<ParsedCommand> {
    let mut tokens = command.split_whitespace();
    let cli = tokens.next()?;
    let integration = integration_for_cli(cli)?;

    let operation = if RESOURCE_SCOPED.contains(&integration) {
        match tokens.next() {
            None => String::new(),
            Some(second) if FLAT_RESOURCES.contains(&second) => second.to_string(),
            // Already in dotted form (`contacts.update`).
            Some(second) if second.contains('.') => second.to_string(),
            Some(second) => match tokens.next() {
                Some(action) => format!("{}.{}", second, action),
                None => second.to_string(),
            },
        }
    } else {
        tokens.next().unwrap_or_default().to_string()
    };

    Some(ParsedCommand {
        integration: integration.to_string(),
        operation,
    })
}

/// Classify an operation against the static read/write tables. `None` means
/// the verb is not in either list; the caller decides via policy.
pub fn classify(integration: &str, operation: &str) -> Option<OperationKind> {
    if RESOURCE_SCOPED.contains(&integration) {
        if FLAT_RESOURCES.contains(&operation) {
            return Some(OperationKind::Read);
        }
        let action = operation.rsplit('.').next()?;
        if RESOURCE_WRITE_ACTIONS.contains(&action) {
            return Some(OperationKind::Write);
        }
        if RESOURCE_READ_ACTIONS.contains(&action) {
            return Some(OperationKind::Read);
        }
        return None;
    }

    let in_table = |table: &[(&str, &[&str])]| {
        table
            .iter()
            .find(|(id, _)| *id == integration)
            .map(|(_, ops)| ops.contains(&operation))
            .unwrap_or(false)
    };

    if in_table(WRITE_OPS) {
        Some(OperationKind::Write)
    } else if in_table(READ_OPS) {
        Some(OperationKind::Read)
    } else {
        None
    }
}

/// Gate one tool call. Only command-execution tools are inspected; everything
/// else auto-allows. Malformed input degrades to "not an integration command"
/// rather than erroring: fail-open for unrelated shell usage, fail-closed for
/// credential-gated integration usage.
pub fn check_permissions(
    tool_name: &str,
    tool_input: &Value,
    connected_integrations: &HashSet<String>,
    policy: PermissionPolicy,
) -> PermissionResult {
    if tool_name != "bash" {
        return PermissionResult::allow();
    }

    let command = match tool_input.get("command").and_then(|v| v.as_str()) {
        Some(c) => c,
        None => return PermissionResult::allow(),
    };

    let parsed = match parse_command(command) {
        Some(p) => p,
        None => return PermissionResult::allow(),
    };

    // Credential presence gates everything: no read/write check happens
    // until the integration is connected.
    if !connected_integrations.contains(&parsed.integration) {
        return PermissionResult::auth(
            &parsed.integration,
            format!("{} is not connected", parsed.integration),
        );
    }

    match classify(&parsed.integration, &parsed.operation) {
        Some(OperationKind::Write) => PermissionResult::approval(
            &parsed.integration,
            format!(
                "{} {} modifies external state",
                parsed.integration, parsed.operation
            ),
        ),
        Some(OperationKind::Read) => PermissionResult::allow(),
        None => {
            if policy.allow_unknown_operations {
                PermissionResult::allow()
            } else {
                PermissionResult::approval(
                    &parsed.integration,
                    format!(
                        "unrecognized {} operation '{}'",
                        parsed.integration, parsed.operation
                    ),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connected(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_two_token_grammar() {
        let parsed = parse_command("gmail send --to a@b.com").unwrap();
        assert_eq!(parsed.integration, "gmail");
        assert_eq!(parsed.operation, "send");
    }

    #[test]
    fn parse_maps_cli_alias_to_integration_id() {
        let parsed = parse_command("x post 'hello'").unwrap();
        assert_eq!(parsed.integration, "twitter");
        assert_eq!(parsed.operation, "post");
    }

    #[test]
    fn parse_resource_scoped_collapses_to_dotted_operation() {
        let parsed = parse_command("hubspot contacts update X").unwrap();
        assert_eq!(parsed.integration, "hubspot");
        assert_eq!(parsed.operation, "contacts.update");
    }

    #[test]
    fn parse_accepts_pre_dotted_resource_action() {
        let parsed = parse_command("hubspot contacts.create --name Ada").unwrap();
        assert_eq!(parsed.operation, "contacts.create");
    }

    #[test]
    fn parse_reserved_resources_stay_flat() {
        assert_eq!(
            parse_command("hubspot owners list").unwrap().operation,
            "owners"
        );
        assert_eq!(
            parse_command("hubspot search 'acme'").unwrap().operation,
            "search"
        );
    }

    #[test]
    fn parse_unknown_cli_returns_none() {
        assert!(parse_command("ls -la").is_none());
        assert!(parse_command("grep foo bar.txt").is_none());
        assert!(parse_command("").is_none());
        assert!(parse_command("   ").is_none());
    }

    #[test]
    fn parse_bare_cli_yields_empty_operation() {
        assert_eq!(parse_command("gmail").unwrap().operation, "");
        assert_eq!(parse_command("hubspot").unwrap().operation, "");
    }

    #[test]
    fn classify_read_and_write_verbs() {
        assert_eq!(classify("gmail", "list"), Some(OperationKind::Read));
        assert_eq!(classify("gmail", "send"), Some(OperationKind::Write));
        assert_eq!(classify("slack", "history"), Some(OperationKind::Read));
        assert_eq!(classify("slack", "send"), Some(OperationKind::Write));
    }

    #[test]
    fn classify_resource_scoped_by_action() {
        assert_eq!(
            classify("hubspot", "contacts.update"),
            Some(OperationKind::Write)
        );
        assert_eq!(
            classify("hubspot", "deals.list"),
            Some(OperationKind::Read)
        );
        assert_eq!(classify("hubspot", "owners"), Some(OperationKind::Read));
        assert_eq!(classify("hubspot", "search"), Some(OperationKind::Read));
    }

    #[test]
    fn classify_unknown_verb_returns_none() {
        assert_eq!(classify("gmail", "frobnicate"), None);
        assert_eq!(classify("hubspot", "contacts.frobnicate"), None);
        assert_eq!(classify("nonexistent", "list"), None);
    }

    #[test]
    fn credentialed_write_needs_approval() {
        let result = check_permissions(
            "bash",
            &json!({"command": "gmail send --to a@b.com"}),
            &connected(&["gmail"]),
            PermissionPolicy::default(),
        );
        assert!(result.needs_approval);
        assert!(!result.allowed);
        assert!(!result.needs_auth);
        assert_eq!(result.integration.as_deref(), Some("gmail"));
    }

    #[test]
    fn missing_credential_needs_auth_even_for_reads() {
        let result = check_permissions(
            "bash",
            &json!({"command": "gmail list"}),
            &connected(&[]),
            PermissionPolicy::default(),
        );
        assert!(result.needs_auth);
        assert!(!result.needs_approval);
        assert_eq!(result.integration.as_deref(), Some("gmail"));
    }

    #[test]
    fn plain_shell_command_is_allowed() {
        let result = check_permissions(
            "bash",
            &json!({"command": "ls -la"}),
            &connected(&[]),
            PermissionPolicy::default(),
        );
        assert!(result.allowed);
        assert!(result.integration.is_none());
    }

    #[test]
    fn non_bash_tools_bypass_the_gate() {
        let result = check_permissions(
            "read_file",
            &json!({"path": "/etc/hosts"}),
            &connected(&[]),
            PermissionPolicy::default(),
        );
        assert!(result.allowed);
    }

    #[test]
    fn malformed_tool_input_is_allowed() {
        let result = check_permissions(
            "bash",
            &json!({"cmd": 42}),
            &connected(&[]),
            PermissionPolicy::default(),
        );
        assert!(result.allowed);
    }

    #[test]
    fn credentialed_read_is_allowed() {
        let result = check_permissions(
            "bash",
            &json!({"command": "slack history #general"}),
            &connected(&["slack"]),
            PermissionPolicy::default(),
        );
        assert!(result.allowed);
    }

    #[test]
    fn unknown_operation_follows_policy_flag() {
        let input = json!({"command": "gmail frobnicate"});
        let creds = connected(&["gmail"]);

        let permissive = check_permissions("bash", &input, &creds, PermissionPolicy::default());
        assert!(permissive.allowed);

        let strict = check_permissions(
            "bash",
            &input,
            &creds,
            PermissionPolicy {
                allow_unknown_operations: false,
            },
        );
        assert!(strict.needs_approval);
        assert!(strict.reason.unwrap().contains("unrecognized"));
    }
}
