/// Resolved UI configuration.
///
/// Priority: explicit CLI arg > env var > TTY auto-detect.
#[derive(Debug, Clone)]
pub struct UiConfig {
    /// Emit ANSI color codes.
    pub color: bool,
    /// Print the report at all. Off for `--format json`.
    pub text: bool,
}

/// Snapshot of the environment variables relevant to UI configuration.
///
/// Tests inject values instead of mutating the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvState {
    /// `NO_COLOR` is set (any value).
    pub no_color: bool,
    /// `CI` is set (any value).
    pub ci: bool,
    /// Value of `CONTRAST_UI` (empty if unset).
    pub contrast_ui: String,
}

impl EnvState {
    pub fn from_env() -> Self {
        Self {
            no_color: std::env::var("NO_COLOR").is_ok(),
            ci: std::env::var("CI").is_ok(),
            contrast_ui: std::env::var("CONTRAST_UI").unwrap_or_default(),
        }
    }
}

impl UiConfig {
    pub fn resolve(is_tty: bool, plain: bool, no_color: bool, format_json: bool) -> Self {
        Self::resolve_with(is_tty, plain, no_color, format_json, &EnvState::from_env())
    }

    /// - `--format json` disables text output.
    /// - `--plain` and `--no-color` disable color regardless of env.
    /// - `CONTRAST_UI=rich/plain` overrides TTY auto-detect.
    /// - `NO_COLOR` and `CI` disable color.
    pub fn resolve_with(
        is_tty: bool,
        plain: bool,
        no_color: bool,
        format_json: bool,
        env: &EnvState,
    ) -> Self {
        if format_json {
            return Self {
                color: false,
                text: false,
            };
        }
        if plain || no_color {
            return Self {
                color: false,
                text: true,
            };
        }
        let color = match env.contrast_ui.as_str() {
            "rich" => true,
            "plain" => false,
            _ => is_tty && !env.no_color && !env.ci,
        };
        Self { color, text: true }
    }
}
