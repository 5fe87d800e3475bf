use std::path::Path;

use eyre::{Context, Result};

use crate::agent::ChatMessage;

/// Markdown instruction prompt of the agentic harness generation flow.
///
/// Turns are separated by `##### {role}` headings; `{{KEY}}` placeholders are
/// reduced at render time.
pub const AGENT_PROMPT: &str = r#"
##### system
Act as a C++ langauge Developer, write a fuzz driver that follow user's instructions.
The prototype of fuzz dirver is: `extern "C" int LLVMFuzzerTestOneInput(const uint8_t *data, size_t size)`.

The fuzz dirver should focus on the usage of the {{PROJECT}} library, and several essential aspects of the library are provided below.

Here are the APIs exported from {{PROJECT}}. You are encouraged to use any of the following APIs once you need to create, initialize or destory variables:
----------------------
{{APIS}}
----------------------

Here are the custom types declared in {{PROJECT}}. Ensure that the variables you use do not violate declarations:
----------------------
{{CONTEXT}}
----------------------

##### user
Create a C++ language program step by step by using {{PROJECT}} library APIs and following the instructions below:
1. Here are several APIs in {{PROJECT}}. Specify an event that those APIs could achieve together, if the input is a byte stream of {{PROJECT}}.
{{COMBINATIONS}};
2. Complete the LLVMFuzzerTestOneInput function to achieve this event by using those APIs. Each API should be called at least once, if possible.
3. The input data and its size are passed as parameters of LLVMFuzzerTestOneInput: `const uint8_t *data` and `size_t size`. They must be consumed by the {{PROJECT}} APIs.
4. Once you need a `FILE *` variable to read the input data, using `FILE * in_file = fmemopen((void *)data, size, "rb")` to produce a `FILE *` variable.
   Once you need a `FILE *` variable to write output data, using `FILE * out_file = fopen("output_file", "wb")` to produce a `FILE *` variable.
5. Once you need a `int` type file descriptor, using `fileno(in_file)` or `fileno(out_file)` to produce a file descriptor for reading or writing.
6. Once you just need a string of file name, directly using "input_file" or "output_file" as the file name.
7. Release all allocated resources before return.

Before writing a harness, call `find_definition`, `find_references`, and `read_file` to gain a sufficient understanding of the given *several* APIs.
(We do not recommend querying all APIs exported from {{PROJECT}}. Only query the necessary APIs, and if more information is needed, perform additional queries when required.)

After you writing a fuzz harness that contains those *several* APIs, call `validate` to verify your harness.
You should fix the harness to pass all validation steps over several iterations.

At each fixing step, analyze the feedback, write your thoughts step-by-step, and rewrite the harness to call `validate` again.

If you understand, start to understand the project, write a harness and call `validate`.
"#;

/// Render a markdown-format instruction prompt into chat messages.
pub struct PromptRenderer {
    markdown: String,
    sep: String,
}

impl PromptRenderer {
    pub fn new(markdown: &str) -> Self {
        Self {
            markdown: markdown.to_string(),
            sep: "#####".to_string(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let markdown = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read the prompt template {path:?}"))?;
        Ok(Self::new(&markdown))
    }

    /// Split on the separator into `{role, content}` turns, reducing each
    /// `{{KEY}}` placeholder with its (upper-cased) binding.
    pub fn render(&self, vars: &[(&str, String)]) -> Vec<ChatMessage> {
        self.markdown
            .split(&self.sep)
            .filter(|turn| !turn.trim().is_empty())
            .map(|turn| {
                let (role, inst) = turn.split_once('\n').unwrap_or((turn, ""));
                let mut inst = inst.trim().to_string();
                for (key, value) in vars {
                    inst = inst.replace(&format!("{{{{{}}}}}", key.to_uppercase()), value);
                }
                ChatMessage::plain(role.trim(), &inst)
            })
            .collect()
    }
}

/// Render gadget signatures into a single block.
pub fn render_signatures(signatures: &[String], sep: &str) -> String {
    signatures.join(sep)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_roles_and_placeholders() {
        let renderer = PromptRenderer::new(
            "\n##### system\nYou work on {{PROJECT}}.\n\n##### user\nUse:\n{{APIS}}\n",
        );
        let messages = renderer.render(&[
            ("project", "cjson".to_string()),
            ("apis", "int f()".to_string()),
        ]);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[0].content.as_deref(), Some("You work on cjson."));
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[1].content.as_deref(), Some("Use:\nint f()"));
    }

    #[test]
    fn test_agent_prompt_parses() {
        let renderer = PromptRenderer::new(AGENT_PROMPT);
        let messages = renderer.render(&[
            ("project", "zlib".to_string()),
            ("apis", "int deflate(z_stream *)".to_string()),
            ("context", "typedef struct z_stream_s z_stream;".to_string()),
            ("combinations", "    int deflate(z_stream *)".to_string()),
        ]);
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.as_deref().unwrap().contains("zlib"));
        assert!(!messages[1].content.as_deref().unwrap().contains("{{"));
    }

    #[test]
    fn test_render_signatures() {
        let signatures = vec!["int f()".to_string(), "void g(int)".to_string()];
        assert_eq!(render_signatures(&signatures, "\n"), "int f()\nvoid g(int)");
        assert_eq!(
            render_signatures(&signatures, ",\n    "),
            "int f(),\n    void g(int)"
        );
    }
}
