use std::path::PathBuf;

use super::{build_shell_command, log_line};

/// A pre-registered shell operation against a managed server target.
///
/// `template` may contain `{}` placeholders that get filled with caller
/// supplied arguments at execution time. `server_scoped` operations are
/// subcommands of the target's entry script; everything else runs from
/// `working_path` as its own command line.
#[derive(Debug, Clone)]
pub(crate) struct CommandSpec {
    pub(crate) name: String,
    pub(crate) template: String,
    pub(crate) server_scoped: bool,
    pub(crate) privilege_user: String,
    pub(crate) working_path: PathBuf,
    pub(crate) sanitize_paths: bool,
}

/// Outcome of one subprocess run. `input_failed` is set when argument
/// collection did not produce a usable token list (timeout, count mismatch
/// or a rejected path token) and the subprocess was never started.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExecutionResult {
    pub(crate) success: bool,
    pub(crate) stdout: Option<String>,
    pub(crate) stderr: Option<String>,
    pub(crate) input_failed: bool,
}

impl ExecutionResult {
    fn input_failure() -> Self {
        ExecutionResult {
            input_failed: true,
            ..Default::default()
        }
    }
}

/// Splits a raw argument reply into shell-style tokens. Unbalanced quoting
/// yields `None`, which callers treat the same as a count mismatch.
pub(crate) fn tokenize_arguments(input: &str) -> Option<Vec<String>> {
    shlex::split(input)
}

/// Normalizes a caller-supplied path token down to a single relative
/// component. One leading `./` or `/` and one trailing `/` are stripped;
/// any separator that survives rejects the token outright, so nothing the
/// caller types can climb out of the operation's working directory.
pub(crate) fn sanitize_path_token(token: &str) -> Option<String> {
    let stripped = token
        .strip_prefix("./")
        .or_else(|| token.strip_prefix('/'))
        .unwrap_or(token);
    let stripped = stripped.strip_suffix('/').unwrap_or(stripped);
    if stripped.is_empty() || stripped.contains('/') {
        None
    } else {
        Some(stripped.to_string())
    }
}

fn stream_text(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes).to_string();
    if text.trim().is_empty() { None } else { Some(text) }
}

impl CommandSpec {
    pub(crate) fn placeholder_count(&self) -> usize {
        self.template.matches("{}").count()
    }

    pub(crate) fn requires_input(&self) -> bool {
        self.placeholder_count() > 0
    }

    /// Fills the template's placeholders left to right. Every token is
    /// wrapped in double quotes so multi-word arguments survive the shell.
    pub(crate) fn render(&self, tokens: &[String]) -> String {
        let mut rendered = self.template.clone();
        for token in tokens {
            rendered = rendered.replacen("{}", &format!("\"{token}\""), 1);
        }
        rendered
    }

    /// The full line handed to `sh -c`.
    pub(crate) fn shell_line(&self, rendered: &str) -> String {
        if self.server_scoped {
            format!("{} {rendered}", self.working_path.display())
        } else {
            format!("cd {} && {rendered}", self.working_path.display())
        }
    }

    /// Runs the operation to completion, capturing both streams.
    ///
    /// When the template has placeholders, `collect_input` is invoked once
    /// with the expected token count and must return the caller's raw reply,
    /// or `None` if no reply arrived in time. The subprocess blocks until
    /// exit; there is no in-flight cancellation.
    pub(crate) fn execute<F>(&self, collect_input: F) -> ExecutionResult
    where
        F: FnOnce(usize) -> Option<String>,
    {
        let needed = self.placeholder_count();
        let mut tokens: Vec<String> = Vec::new();

        if needed > 0 {
            let reply = match collect_input(needed) {
                Some(reply) => reply,
                None => return ExecutionResult::input_failure(),
            };
            let parsed = match tokenize_arguments(&reply) {
                Some(parsed) => parsed,
                None => return ExecutionResult::input_failure(),
            };
            if parsed.len() != needed {
                return ExecutionResult::input_failure();
            }
            if self.sanitize_paths {
                for token in &parsed {
                    match sanitize_path_token(token) {
                        Some(clean) => tokens.push(clean),
                        None => return ExecutionResult::input_failure(),
                    }
                }
            } else {
                tokens = parsed;
            }
        }

        let line = self.shell_line(&self.render(&tokens));
        log_line("exec", &format!("running `{}` for {}", self.name, line));

        match build_shell_command(&self.privilege_user, &line).output() {
            Ok(output) => ExecutionResult {
                success: output.status.success(),
                stdout: stream_text(&output.stdout),
                stderr: stream_text(&output.stderr),
                input_failed: false,
            },
            Err(err) => ExecutionResult {
                success: false,
                stdout: None,
                stderr: Some(format!("failed to launch `{line}`: {err}")),
                input_failed: false,
            },
        }
    }
}
