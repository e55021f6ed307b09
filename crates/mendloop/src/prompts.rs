//! Prompt text for the repair loop.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever preamble content changes.
//! The version is logged with every model call so a trajectory can be traced
//! back to the prompt that produced it.

use std::path::{Path, PathBuf};

use coordination::{BuildObservation, ParserConfig};

/// Prompt version. Bump on any preamble content change.
pub const PROMPT_VERSION: &str = "1.2.0";

/// Repair preamble. `{format}` is replaced with the marker instructions.
pub const REPAIR_PREAMBLE: &str = "\
You are fixing a project that fails to build. You are given the first build error, \
the code around it and, when available, fixes that worked for similar errors earlier \
in this session.

## Rules
- Fix the error shown. Do not refactor unrelated code.
- Never delete or weaken tests to make the build pass.
- Each find block must be copied verbatim from the current file, including indentation. \
  Keep find blocks short but unique.
- You may change several files; use one change block per file.

## Response format
{format}";

/// Appended when the model may ask for more files before answering.
pub const CONTEXT_REQUEST_NOTE: &str = "\
If you cannot fix the error without seeing other files, reply ONLY with their paths \
relative to the project root, one per line, inside a single block:
{context}";

pub const CORRECTION_PROMPT: &str = "\
The response is incorrect, as it doesn't fix the build error. Please generate a full solution again.
Below are details:
{feedback}";

/// Renders prompts with the markers the response parser expects.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    parser: ParserConfig,
    allow_context_requests: bool,
}

/// Everything the repair prompt shows about one diagnostic.
#[derive(Debug, Clone, Default)]
pub struct RepairContext<'a> {
    pub target: Option<&'a BuildObservation>,
    pub examples: Vec<&'a str>,
    /// Rendered reflection block for a diagnostic seen before.
    pub reflection: Option<String>,
    /// Build descriptor of the project the target belongs to, relative to the root.
    pub project: Option<PathBuf>,
}

impl PromptBuilder {
    pub fn new(parser: ParserConfig) -> Self {
        Self {
            parser,
            allow_context_requests: true,
        }
    }

    pub fn with_context_requests(mut self, allow: bool) -> Self {
        self.allow_context_requests = allow;
        self
    }

    fn block(&self, name: &str, body: &str) -> String {
        let (start, end) = self.parser.format.templates();
        format!(
            "{}\n{}\n{}",
            start.replace("{name}", name),
            body,
            end.replace("{name}", name)
        )
    }

    fn group_marker(&self, template: &str, file: &str) -> String {
        template
            .replace("{name}", &self.parser.group)
            .replace("{file}", file)
    }

    /// Example of a well-formed response for the configured markers.
    pub fn format_instructions(&self) -> String {
        let file = "path/to/File.java";
        format!(
            "{}\n{}\n\n{}\n{}",
            self.group_marker(&self.parser.group_start, file),
            self.block(&self.parser.find, "<exact lines to replace>"),
            self.block(&self.parser.replace, "<new lines>"),
            self.group_marker(&self.parser.group_end, file),
        )
    }

    /// Preamble with format instructions filled in.
    pub fn preamble(&self) -> String {
        let mut preamble = REPAIR_PREAMBLE.replace("{format}", &self.format_instructions());
        if self.allow_context_requests {
            let request = self.block(&self.parser.context_file, "path/to/Other.java");
            preamble.push_str("\n\n");
            preamble.push_str(&CONTEXT_REQUEST_NOTE.replace("{context}", &request));
        }
        preamble
    }

    pub fn repair_prompt(&self, ctx: &RepairContext<'_>) -> String {
        let mut sections = vec![self.preamble()];

        if let Some(target) = ctx.target {
            sections.push(render_error(target, ctx.project.as_deref()));
            if let Some(snippet) = &target.snippet {
                sections.push(format!("<code>\n{}\n</code>", snippet));
            }
        }

        if !ctx.examples.is_empty() {
            let examples: Vec<String> = ctx
                .examples
                .iter()
                .map(|e| format!("<example>\n{}\n</example>", e))
                .collect();
            sections.push(format!(
                "Fixes accepted earlier for similar errors:\n<examples>\n{}\n</examples>",
                examples.join("\n")
            ));
        }

        if let Some(reflection) = &ctx.reflection {
            sections.push(reflection.clone());
        }

        sections.join("\n\n")
    }

    /// Follow-up after a rejected response.
    pub fn correction_prompt(&self, feedback: &str) -> String {
        CORRECTION_PROMPT.replace("{feedback}", feedback)
    }

    /// Reply to a context request: the files found, and the ones that were not.
    pub fn context_reply(&self, attached: &[(PathBuf, String)], missing: &[PathBuf]) -> String {
        let mut reply = String::new();
        if !attached.is_empty() {
            let files: Vec<String> = attached.iter().map(|(p, c)| render_file(p, c)).collect();
            reply.push_str(&format!(
                "Here are the requested files:\n<context_files>\n{}\n</context_files>\n",
                files.join("\n")
            ));
        }
        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(|p| p.display().to_string()).collect();
            reply.push_str(&format!("These files do not exist: {}\n", names.join(", ")));
        }
        reply.push_str("Now fix the build error using the response format above.");
        reply
    }
}

fn render_error(target: &BuildObservation, project: Option<&Path>) -> String {
    let mut lines = vec!["<error>".to_string()];
    match &target.file {
        Some(file) => lines.push(format!("File: {}", file.display())),
        None => lines.push("File: (build descriptor)".to_string()),
    }
    match (target.line, target.column) {
        (Some(line), Some(column)) => lines.push(format!("Line: {line}, Column: {column}")),
        (Some(line), None) => lines.push(format!("Line: {line}")),
        _ => {}
    }
    if let Some(code) = &target.code {
        lines.push(format!("Code: {code}"));
    }
    if let Some(project) = project.or(target.project.as_deref()) {
        lines.push(format!("Project: {}", project.display()));
    }
    lines.push(format!("Message:\n{}", target.message));
    if let Some(requirement) = &target.requirement {
        lines.push(format!("Requirement:\n{requirement}"));
    }
    lines.push("</error>".to_string());
    lines.join("\n")
}

fn render_file(path: &Path, content: &str) -> String {
    format!("<file path=\"{}\">\n{}\n</file>", path.display(), content.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordination::GroupedParser;

    fn target() -> BuildObservation {
        BuildObservation::new("cannot find symbol\n  symbol: class Foo")
            .with_file("src/main/java/App.java")
            .at(12, Some(8))
            .with_snippet("class App {  //  Compilation error is at this line.")
    }

    #[test]
    fn test_repair_prompt_sections() {
        let builder = PromptBuilder::new(ParserConfig::default());
        let target = target();
        let prompt = builder.repair_prompt(&RepairContext {
            target: Some(&target),
            examples: vec!["[Change Start A.java]..."],
            reflection: Some("<reflection>\nmissing import\n</reflection>".into()),
            project: Some(PathBuf::from("pom.xml")),
        });

        assert!(prompt.contains("File: src/main/java/App.java"));
        assert!(prompt.contains("Line: 12, Column: 8"));
        assert!(prompt.contains("symbol: class Foo"));
        assert!(prompt.contains("<code>\nclass App {"));
        assert!(prompt.contains("<examples>\n<example>\n[Change Start A.java]..."));
        assert!(prompt.contains("<reflection>"));
        assert!(prompt.contains("Project: pom.xml"));
        assert!(prompt.contains("[ContextFile Start]"));
    }

    #[test]
    fn test_optional_sections_omitted() {
        let builder = PromptBuilder::new(ParserConfig::default()).with_context_requests(false);
        let target = BuildObservation::new("Non-resolvable parent POM");
        let prompt = builder.repair_prompt(&RepairContext {
            target: Some(&target),
            ..Default::default()
        });
        assert!(prompt.contains("File: (build descriptor)"));
        assert!(!prompt.contains("<examples>"));
        assert!(!prompt.contains("<code>"));
        assert!(!prompt.contains("ContextFile"));
        assert!(!prompt.contains("Project:"));
    }

    #[test]
    fn test_format_instructions_parse_back() {
        for config in [ParserConfig::default(), ParserConfig::xml()] {
            let builder = PromptBuilder::new(config.clone());
            let outcome = GroupedParser::new(&config)
                .unwrap()
                .parse(&builder.format_instructions());
            assert!(outcome.feedback.is_empty(), "{:?}", outcome.feedback);
            assert_eq!(outcome.edit_count(), 1);
        }
    }

    #[test]
    fn test_correction_prompt() {
        let builder = PromptBuilder::new(ParserConfig::default());
        assert_eq!(
            builder.correction_prompt("[Feedback Start]x[Feedback End]"),
            "The response is incorrect, as it doesn't fix the build error. Please generate a full solution again.\nBelow are details:\n[Feedback Start]x[Feedback End]"
        );
    }

    #[test]
    fn test_context_reply() {
        let builder = PromptBuilder::new(ParserConfig::default());
        let reply = builder.context_reply(
            &[(PathBuf::from("a/B.java"), "class B {}".into())],
            &[PathBuf::from("c/D.java")],
        );
        assert!(reply.contains("<file path=\"a/B.java\">"));
        assert!(reply.contains("These files do not exist: c/D.java"));
    }
}
