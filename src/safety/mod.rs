//! Static safety classifier for shell commands, particularly `kubectl`
//! (spec §4.5, component C6).
//!
//! No precedent in the teacher crate — it has no shell-parsing code at
//! all. Grounded on the corpus-wide precedent of `shell-words`/`shlex`
//! appearing as the shell-tokenizing crate of choice across several
//! retrieval-pack manifests. The classifier is purely functional and
//! idempotent (spec §8): `classify(cmd)` depends only on `cmd`.

use std::collections::HashSet;

/// Resource-mutation verdict for a shell command (spec §4.5's
/// `{yes, no, unknown}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Yes,
    No,
    Unknown,
}

impl Mutation {
    pub fn is_mutating(self) -> bool {
        matches!(self, Mutation::Yes)
    }
}

const READ_ONLY_VERBS: &[&str] = &[
    "get", "describe", "explain", "top", "logs", "api-resources", "api-versions", "version", "config",
    "cluster-info", "wait", "auth", "diff", "kustomize", "help", "options", "proxy", "completion",
    "convert", "events", "port-forward", "can-i", "whoami",
];

const WRITE_VERBS: &[&str] = &[
    "create", "apply", "edit", "delete", "patch", "replace", "scale", "autoscale", "expose", "run",
    "exec", "set", "label", "annotate", "taint", "drain", "cordon", "uncordon", "debug", "attach", "cp",
    "reconcile", "approve", "deny", "certificate",
];

const ROLLOUT_READ_ONLY_SUBVERBS: &[&str] = &["history", "status"];
const ROLLOUT_WRITE_SUBVERBS: &[&str] = &["pause", "restart", "resume", "undo"];

/// Flags that take a value as a separate following argument rather than
/// `--flag=value`, e.g. `--context prod`. Any such flag appearing before
/// the verb makes static parsing too ambiguous (spec §4.5 step 1).
const SPACE_SEPARATED_GLOBAL_FLAGS: &[&str] = &[
    "--context", "--namespace", "-n", "--kubeconfig", "--cluster", "--user", "--server", "-s",
    "--token", "--as", "--as-group", "--request-timeout", "-o", "--output",
];

/// Boolean (no-value) global flags that may appear before the verb
/// without forcing an `unknown` verdict.
const BOOLEAN_GLOBAL_FLAGS: &[&str] = &[
    "-v", "--v", "--insecure-skip-tls-verify", "--match-server-version", "--all-namespaces", "-A",
];

/// Classify a single shell command string (which may itself be a
/// `;`/`&&`/`||`-joined sequence of statements, or a `|`-joined pipeline)
/// for whether it mutates cluster state.
pub fn classify(command: &str) -> Mutation {
    if command.trim().is_empty() {
        return Mutation::No;
    }

    let statements = split_sequential(command);
    let mut verdicts = Vec::with_capacity(statements.len());

    for statement in statements {
        verdicts.push(classify_possible_pipeline(&statement));
    }

    // spec §4.5: "if any resolves to `yes`, the whole command resolves
    // to `yes`" for `;`/`&&`/`||` sequencing.
    if verdicts.iter().any(|v| *v == Mutation::Yes) {
        return Mutation::Yes;
    }
    if verdicts.iter().all(|v| *v == Mutation::No) {
        return Mutation::No;
    }
    Mutation::Unknown
}

/// A `|`-joined pipeline is classified as `unknown` whenever a kubectl
/// write verb appears on either side (spec §9's Open Question
/// resolution, recorded in DESIGN.md): piping is not the same ambiguity
/// as `;`/`&&`/`||` sequencing, so it does not get the "any yes wins"
/// treatment.
fn classify_possible_pipeline(statement: &str) -> Mutation {
    let stages: Vec<&str> = statement.split('|').collect();
    if stages.len() == 1 {
        return classify_statement(stages[0]);
    }

    let mut any_write = false;
    let mut any_unknown = false;
    for stage in &stages {
        match classify_pipeline_stage(stage) {
            Mutation::Yes => any_write = true,
            Mutation::Unknown => any_unknown = true,
            Mutation::No => {}
        }
    }

    if any_write || any_unknown {
        Mutation::Unknown
    } else {
        Mutation::No
    }
}

/// Classify one stage of a `|`-joined pipeline. Unlike a standalone
/// statement, a non-kubectl stage here (`jq`, `grep`, `wc`, …) is neutral
/// rather than `unknown` — piping kubectl output through a formatter is
/// the overwhelmingly common case and carries no mutation risk of its
/// own, so only a kubectl write verb or genuine parse ambiguity should
/// push the whole pipeline to `unknown`.
fn classify_pipeline_stage(stage: &str) -> Mutation {
    let stage = stage.trim();
    if stage.is_empty() {
        return Mutation::No;
    }

    let tokens = match shell_words::split(stage) {
        Ok(t) => t,
        Err(_) => return Mutation::Unknown,
    };
    if tokens.is_empty() {
        return Mutation::No;
    }
    if is_argv0_quoted(stage) {
        return Mutation::Unknown;
    }

    let argv0_basename = tokens[0].rsplit(['/', '\\']).next().unwrap_or(&tokens[0]);
    if argv0_basename != "kubectl" && argv0_basename != "kubectl.exe" {
        return Mutation::No;
    }

    classify_kubectl_args(&tokens[1..])
}

/// Split a command on `;`, `&&`, `||` into independent statements. This
/// is a lightweight tokenizer, not a full shell grammar: it respects
/// single/double quoting so separators inside quoted strings aren't
/// treated as statement boundaries.
fn split_sequential(command: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(c);
            }
            ';' if !in_single && !in_double => {
                statements.push(current.clone());
                current.clear();
            }
            '&' if !in_single && !in_double && chars.peek() == Some(&'&') => {
                chars.next();
                statements.push(current.clone());
                current.clear();
            }
            '|' if !in_single && !in_double && chars.peek() == Some(&'|') => {
                chars.next();
                statements.push(current.clone());
                current.clear();
            }
            other => current.push(other),
        }
    }
    if !current.trim().is_empty() {
        statements.push(current);
    }
    statements
}

fn classify_statement(statement: &str) -> Mutation {
    let statement = statement.trim();
    if statement.is_empty() {
        return Mutation::No;
    }

    let tokens = match shell_words::split(statement) {
        Ok(t) => t,
        Err(_) => return Mutation::Unknown,
    };
    if tokens.is_empty() {
        return Mutation::No;
    }

    // Quoted argv[0] is treated as "unknown" (defensive) — shell-words
    // strips quoting, so detect it from the raw source instead.
    if is_argv0_quoted(statement) {
        return Mutation::Unknown;
    }

    let argv0_basename = tokens[0].rsplit(['/', '\\']).next().unwrap_or(&tokens[0]);
    if argv0_basename != "kubectl" && argv0_basename != "kubectl.exe" {
        // Not a kubectl invocation at all; this classifier only judges
        // kubectl commands (spec §4.5's scope). Anything else defaults to
        // unknown so callers fall back to the permission prompt.
        return Mutation::Unknown;
    }

    classify_kubectl_args(&tokens[1..])
}

fn is_argv0_quoted(statement: &str) -> bool {
    let trimmed = statement.trim_start();
    trimmed.starts_with('\'') || trimmed.starts_with('"')
}

fn classify_kubectl_args(args: &[String]) -> Mutation {
    let space_separated: HashSet<&str> = SPACE_SEPARATED_GLOBAL_FLAGS.iter().copied().collect();
    let boolean_flags: HashSet<&str> = BOOLEAN_GLOBAL_FLAGS.iter().copied().collect();

    let mut idx = 0;
    let mut has_dry_run = false;

    // Walk flags preceding the verb. Any ambiguous (space-separated
    // key-value) flag before the verb forces `unknown` (spec §4.5 step
    // 1); recognized boolean flags are skipped.
    while idx < args.len() {
        let arg = args[idx].as_str();
        if !arg.starts_with('-') {
            break;
        }
        if is_dry_run_flag(args, idx) {
            has_dry_run = true;
            idx += dry_run_flag_width(args, idx);
            continue;
        }
        if space_separated.contains(arg) || is_space_separated_eq_form(arg, &space_separated) {
            return Mutation::Unknown;
        }
        if boolean_flags.contains(arg) {
            idx += 1;
            continue;
        }
        if arg.contains('=') {
            // `--flag=value` form doesn't consume a following token.
            idx += 1;
            continue;
        }
        // Unrecognized flag before the verb: too ambiguous to be sure it
        // doesn't take a following value argument.
        return Mutation::Unknown;
    }

    // Scan the remaining args for --dry-run in any position (spec §4.5
    // step 2 applies regardless of where it appears).
    let mut remaining_idx = idx;
    while remaining_idx < args.len() {
        if is_dry_run_flag(args, remaining_idx) {
            has_dry_run = true;
        }
        remaining_idx += 1;
    }

    let mut positional = args[idx..].iter().filter(|a| !a.starts_with('-'));
    let verb = match positional.next() {
        Some(v) => v.as_str(),
        None => return Mutation::Unknown,
    };
    let subverb = positional.next().map(String::as_str);

    let (is_read, is_write) = classify_verb(verb, subverb);

    if is_write && !has_dry_run {
        Mutation::Yes
    } else if is_read || (is_write && has_dry_run) {
        Mutation::No
    } else {
        Mutation::Unknown
    }
}

fn classify_verb(verb: &str, subverb: Option<&str>) -> (bool, bool) {
    if verb == "rollout" {
        return match subverb {
            Some(s) if ROLLOUT_READ_ONLY_SUBVERBS.contains(&s) => (true, false),
            Some(s) if ROLLOUT_WRITE_SUBVERBS.contains(&s) => (false, true),
            _ => (false, false),
        };
    }

    let is_read = READ_ONLY_VERBS.contains(&verb);
    let is_write = WRITE_VERBS.contains(&verb);
    (is_read, is_write)
}

fn is_dry_run_flag(args: &[String], idx: usize) -> bool {
    let arg = args[idx].as_str();
    if arg == "--dry-run" {
        // Either `--dry-run client|server` or a bare boolean form.
        return true;
    }
    arg.starts_with("--dry-run=")
}

fn dry_run_flag_width(args: &[String], idx: usize) -> usize {
    let arg = args[idx].as_str();
    if arg == "--dry-run" {
        if args.get(idx + 1).map(String::as_str) == Some("client") || args.get(idx + 1).map(String::as_str) == Some("server") {
            return 2;
        }
        return 1;
    }
    1
}

fn is_space_separated_eq_form(arg: &str, space_separated: &HashSet<&str>) -> bool {
    match arg.split_once('=') {
        Some((key, _)) => space_separated.contains(key),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_query_is_no() {
        assert_eq!(classify("kubectl get pods -n default"), Mutation::No);
    }

    #[test]
    fn mutating_scale_is_yes() {
        assert_eq!(classify("kubectl scale deployment/nginx --replicas=3"), Mutation::Yes);
    }

    #[test]
    fn dry_run_client_write_is_no() {
        assert_eq!(classify("kubectl delete pod foo --dry-run=client"), Mutation::No);
        assert_eq!(classify("kubectl delete pod foo --dry-run client"), Mutation::No);
        assert_eq!(classify("kubectl delete pod foo --dry-run=server"), Mutation::No);
    }

    #[test]
    fn compound_sequential_command_is_yes_if_any_statement_is() {
        assert_eq!(classify("kubectl get pods; kubectl delete pod bad"), Mutation::Yes);
        assert_eq!(classify("kubectl get pods && kubectl delete pod bad"), Mutation::Yes);
    }

    #[test]
    fn quoted_argv0_is_unknown() {
        assert_eq!(classify("'kubectl' get pods"), Mutation::Unknown);
        assert_eq!(classify("\"kubectl\" delete pod foo"), Mutation::Unknown);
    }

    #[test]
    fn non_kubectl_command_is_unknown() {
        assert_eq!(classify("ls -la"), Mutation::Unknown);
    }

    #[test]
    fn ambiguous_space_separated_flag_before_verb_is_unknown() {
        assert_eq!(classify("kubectl --context prod get pods"), Mutation::Unknown);
    }

    #[test]
    fn boolean_flag_before_verb_does_not_force_unknown() {
        assert_eq!(classify("kubectl -v=6 get pods"), Mutation::No);
    }

    #[test]
    fn rollout_subverbs_classify_correctly() {
        assert_eq!(classify("kubectl rollout status deployment/nginx"), Mutation::No);
        assert_eq!(classify("kubectl rollout restart deployment/nginx"), Mutation::Yes);
        assert_eq!(classify("kubectl rollout undo deployment/nginx"), Mutation::Yes);
    }

    #[test]
    fn idempotent_and_pure() {
        let cmd = "kubectl apply -f deploy.yaml";
        assert_eq!(classify(cmd), classify(cmd));
    }

    #[test]
    fn pipeline_with_write_verb_is_unknown() {
        assert_eq!(classify("kubectl get pods | kubectl delete -f -"), Mutation::Unknown);
    }

    #[test]
    fn pipeline_of_read_only_commands_is_no() {
        assert_eq!(classify("kubectl get pods -o json | jq '.items'"), Mutation::No);
    }

    #[test]
    fn certificate_approve_is_write() {
        assert_eq!(classify("kubectl certificate approve my-csr"), Mutation::Yes);
        assert_eq!(classify("kubectl approve csr my-csr"), Mutation::Yes);
    }

    #[test]
    fn kubectl_exe_basename_recognized() {
        assert_eq!(classify("kubectl.exe get pods"), Mutation::No);
        assert_eq!(classify("/usr/local/bin/kubectl.exe delete pod foo"), Mutation::Yes);
    }

    #[test]
    fn empty_command_is_no() {
        assert_eq!(classify(""), Mutation::No);
        assert_eq!(classify("   "), Mutation::No);
    }

    #[test]
    fn unparsable_shell_syntax_is_unknown() {
        assert_eq!(classify("kubectl get pods '"), Mutation::Unknown);
    }
}
