use std::path::Path;

pub use shell_command::{CommandOutput, CommandRunner, shell_runner};

/// Shell command with `@NAME@` placeholders for file paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    raw: String,
}

impl CommandTemplate {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// Substitutes each placeholder with the shell-quoted path.
    pub fn render(&self, substitutions: &[(&str, &Path)]) -> String {
        substitutions
            .iter()
            .fold(self.raw.clone(), |command, (placeholder, path)| {
                command.replace(placeholder, &shell_quote(path))
            })
    }
}

fn shell_quote(path: &Path) -> String {
    let raw = path.to_string_lossy();
    format!("'{}'", raw.replace('\'', r"'\''"))
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn render_quotes_paths() {
        let template = CommandTemplate::new("heif-convert @INPUT@ @OUTPUT@");
        let input = PathBuf::from("/tmp/it's here.heic");
        let output = PathBuf::from("/tmp/out.jpg");
        assert_eq!(
            template.render(&[("@INPUT@", &input), ("@OUTPUT@", &output)]),
            r"heif-convert '/tmp/it'\''s here.heic' '/tmp/out.jpg'"
        );
    }
}
