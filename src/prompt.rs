//! Agent prompt assembly

use std::fmt::Write;

use crate::challenge::{ChallengeData, FileMetadata};

pub const DOWNLOADED: &str = "downloaded";

/// Renders the task description every agent receives as `/challenge/prompt.txt`
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    files: Vec<FileMetadata>,
    hints: Option<String>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn files(mut self, files: &[FileMetadata]) -> Self {
        self.files = files.to_vec();
        self
    }

    /// Pre-formatted hint section, see [`crate::platform::HintPolicy::format`]
    pub fn hints(mut self, hints: Option<String>) -> Self {
        self.hints = hints;
        self
    }

    pub fn build(&self, challenge: &ChallengeData) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# CTF Challenge: {}", challenge.name);
        if let Some(category) = &challenge.category {
            let _ = writeln!(out, "Category: {}", category);
        }

        let _ = writeln!(out, "\n## Problem\n{}", challenge.text.trim());
        let _ = writeln!(out, "\n## Files\n{}", self.files_section());

        if let Some(hints) = &self.hints {
            let _ = writeln!(out, "\n## Hints\n{}", hints.trim());
        }

        out.push_str(INSTRUCTIONS);
        out
    }

    fn files_section(&self) -> String {
        if self.files.is_empty() {
            return "No distributed files.".to_string();
        }
        self.files
            .iter()
            .map(|f| {
                if f.status == DOWNLOADED {
                    format!(
                        "- {} ({} bytes) -> /challenge/files/{}",
                        f.filename, f.size, f.filename
                    )
                } else {
                    format!("- {} ({})", f.filename, f.status)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

const INSTRUCTIONS: &str = "
## Environment
- /challenge: problem statement, this prompt and distributed files (read-only)
- /scratch: private working directory, write and run anything here
- /shared/rejected_answers.txt: answers already judged wrong, one per line
- /shared/approaches.txt: notes on approaches that already failed

## Rules
1. Identify the category and analyse the files under /challenge/files.
2. Read /shared before starting. Never reproduce a rejected answer and try
   something different from the failed approaches.
3. Do not submit to the scoring platform yourself.
4. When you are confident, write the exact flag as a single line to
   /output/answer.txt and exit. Write nothing there if you found nothing.
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::ChallengeId;

    fn challenge() -> ChallengeData {
        ChallengeData {
            id: ChallengeId(4),
            name: "baby rsa".to_string(),
            category: Some("crypto".to_string()),
            text: "  n = 3233, e = 17  ".to_string(),
            hints: vec![],
            files: vec![],
        }
    }

    #[test]
    fn test_prompt_without_files_or_hints() {
        let prompt = PromptBuilder::new().build(&challenge());
        assert!(prompt.starts_with("# CTF Challenge: baby rsa\nCategory: crypto\n"));
        assert!(prompt.contains("## Problem\nn = 3233, e = 17\n"));
        assert!(prompt.contains("No distributed files."));
        assert!(!prompt.contains("## Hints"));
        assert!(prompt.contains("/output/answer.txt"));
    }

    #[test]
    fn test_prompt_lists_files_and_hints() {
        let files = vec![
            FileMetadata {
                filename: "chall.py".into(),
                url: "/files/a/chall.py".into(),
                size: 120,
                status: DOWNLOADED.into(),
            },
            FileMetadata {
                filename: "huge.pcap".into(),
                url: "/files/b/huge.pcap".into(),
                size: 0,
                status: "too_large".into(),
            },
        ];
        let prompt = PromptBuilder::new()
            .files(&files)
            .hints(Some("### Hint 1\nsmall e".into()))
            .build(&challenge());

        assert!(prompt.contains("- chall.py (120 bytes) -> /challenge/files/chall.py"));
        assert!(prompt.contains("- huge.pcap (too_large)"));
        assert!(prompt.contains("## Hints\n### Hint 1\nsmall e"));
    }
}
