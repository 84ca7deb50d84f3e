//! Command helpers with benign-failure suppression.

use shaper_core::command::CommandError;

use super::Shaper;
use crate::tc::FilterConfig;

pub(crate) struct CommandOpts<'a> {
    pub suppress: &'a [&'a str],
    pub quiet: bool,
}

impl Default for CommandOpts<'_> {
    fn default() -> Self {
        Self { suppress: &[], quiet: false }
    }
}

impl Shaper {
    pub(crate) async fn exec_command(
        &self,
        name: &str,
        args: &[String],
        opts: CommandOpts<'_>,
    ) -> Result<(), CommandError> {
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        match self.runner.run(name, &arg_refs).await {
            Ok(output) => {
                let trimmed = output.trim();
                if !opts.quiet && !trimmed.is_empty() {
                    tracing::debug!(cmd = name, args = %args.join(" "), output = trimmed, "command output");
                }
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                let output = err.output().trim().to_string();

                if !opts.suppress.is_empty()
                    && (contains_any(&output, opts.suppress) || contains_any(&message, opts.suppress))
                {
                    if !opts.quiet && !output.is_empty() {
                        tracing::debug!(cmd = name, args = %args.join(" "), output = %output, "benign failure suppressed");
                    }
                    return Ok(());
                }

                Err(err)
            }
        }
    }

    pub(crate) async fn run(&self, name: &str, args: &[String]) -> Result<(), CommandError> {
        self.exec_command(name, args, CommandOpts::default()).await
    }

    /// Runs a command whose expected failures should be swallowed quietly.
    pub(crate) async fn run_optional(
        &self,
        name: &str,
        args: &[String],
        suppressed: &[&str],
    ) -> Result<(), CommandError> {
        self.exec_command(name, args, CommandOpts { suppress: suppressed, quiet: true }).await
    }

    pub(crate) async fn run_quiet(&self, name: &str, args: &[String]) -> Result<(), CommandError> {
        self.exec_command(name, args, CommandOpts { suppress: &[], quiet: true }).await
    }

    pub(crate) async fn run_get_output(
        &self,
        name: &str,
        args: &[&str],
    ) -> Result<String, CommandError> {
        self.runner.run(name, args).await
    }

    /// Replaces a tc filter by deleting first (errors ignored) then adding.
    pub(crate) async fn replace_filter(&self, cfg: &FilterConfig) -> Result<(), CommandError> {
        let _ = self.run_quiet("tc", &cfg.delete_args()).await;
        self.run("tc", &cfg.add_args()).await
    }
}

pub(crate) fn contains_any(message: &str, substrings: &[&str]) -> bool {
    if message.is_empty() || substrings.is_empty() {
        return false;
    }
    let lower = message.to_lowercase();
    substrings
        .iter()
        .filter(|sub| !sub.is_empty())
        .any(|sub| lower.contains(&sub.to_lowercase()))
}

pub(crate) fn string_args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substring_matching_is_case_insensitive() {
        assert!(contains_any("RTNETLINK: Operation not supported", &["operation not supported"]));
        assert!(!contains_any("no such device", &["operation not supported"]));
        assert!(!contains_any("", &["anything"]));
        assert!(!contains_any("text", &[]));
    }
}
