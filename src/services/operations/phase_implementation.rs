//! Phase Implementation
//!
//! Generates the files of one phase by streaming the model's output through
//! an incremental block parser. File boundaries surface as protocol events
//! while bytes are still arriving:
//!
//! `file_generating(path) ≺ file_chunk_generated(path)* ≺ file_generated(path)`
//!
//! When the realtime fixer is active, each completed file is handed to a
//! concurrent per-file fixing task; the state machine awaits those handles
//! before saving, so fixes land in the same commit as the phase.

use appforge_core::events::AgentEvent;
use appforge_llm::{LlmRequestOptions, Message};
use regex::Regex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::phase::{GeneratedFile, PhaseConcept};
use crate::services::operations::fast_fixer;
use crate::services::operations::phase_planning::UserContext;
use crate::services::operations::{stream_with_chunks, OperationContext};
use crate::services::sandbox::AnalysisIssue;
use crate::utils::error::AppResult;

const FILE_OPEN: &str = "<file ";
const FILE_CLOSE: &str = "</file>";
const COMMANDS_OPEN: &str = "<commands>";
const COMMANDS_CLOSE: &str = "</commands>";

/// Events produced by the incremental parser.
#[derive(Debug, Clone, PartialEq)]
pub enum FileEvent {
    Started { path: String, purpose: String },
    Chunk { path: String, delta: String },
    Completed { file: GeneratedFile },
}

/// Incremental parser over the model's streamed implementation output.
///
/// Recognizes `<file path=".." purpose="..">…</file>` blocks and a trailing
/// `<commands>…</commands>` block. Tag fragments split across chunk
/// boundaries are buffered until complete.
pub struct FileStreamParser {
    buffer: String,
    current: Option<CurrentFile>,
    commands: Vec<String>,
    attr_re: Regex,
}

struct CurrentFile {
    path: String,
    purpose: String,
    contents: String,
}

impl Default for FileStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FileStreamParser {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            current: None,
            commands: Vec::new(),
            attr_re: Regex::new(r#"(\w+)="([^"]*)""#).expect("static attribute regex"),
        }
    }

    /// Feed a chunk; returns the events it unlocked.
    pub fn push(&mut self, chunk: &str) -> Vec<FileEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        loop {
            let before = self.buffer.len();
            if self.current.is_some() {
                self.drain_file_body(&mut events);
            } else {
                self.scan_outside(&mut events);
            }
            // No consumption means nothing more can happen without new input.
            if self.buffer.len() == before {
                break;
            }
        }
        events
    }

    /// Flush at stream end: an unclosed file completes with what arrived.
    pub fn finish(&mut self) -> Vec<FileEvent> {
        let mut events = Vec::new();
        if let Some(mut current) = self.current.take() {
            warn!(path = %current.path, "file block unterminated at stream end");
            if !self.buffer.is_empty() {
                current.contents.push_str(&self.buffer);
                events.push(FileEvent::Chunk {
                    path: current.path.clone(),
                    delta: std::mem::take(&mut self.buffer),
                });
            }
            events.push(complete_event(current));
        }
        self.buffer.clear();
        events
    }

    /// Commands collected from the `<commands>` block so far.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    fn scan_outside(&mut self, events: &mut Vec<FileEvent>) {
        let file_at = self.buffer.find(FILE_OPEN);
        let commands_at = self.buffer.find(COMMANDS_OPEN);

        match (file_at, commands_at) {
            (Some(f), Some(c)) if c < f => self.take_commands_block(c),
            (Some(f), _) => self.open_file_block(f, events),
            (None, Some(c)) => self.take_commands_block(c),
            (None, None) => self.trim_prose(),
        }
    }

    fn open_file_block(&mut self, start: usize, events: &mut Vec<FileEvent>) {
        let Some(tag_end) = self.buffer[start..].find('>') else {
            // Tag still incomplete; drop prose before it and wait.
            self.buffer.drain(..start);
            return;
        };
        let tag_end = start + tag_end;
        let attrs = self.buffer[start + FILE_OPEN.len()..tag_end].to_string();
        let mut path = String::new();
        let mut purpose = String::new();
        for capture in self.attr_re.captures_iter(&attrs) {
            match &capture[1] {
                "path" => path = capture[2].to_string(),
                "purpose" => purpose = capture[2].to_string(),
                _ => {}
            }
        }
        self.buffer.drain(..=tag_end);
        if self.buffer.starts_with('\n') {
            self.buffer.remove(0);
        }
        if path.is_empty() {
            warn!("file block missing path attribute; skipping");
            return;
        }
        debug!(%path, "file block opened");
        events.push(FileEvent::Started {
            path: path.clone(),
            purpose: purpose.clone(),
        });
        self.current = Some(CurrentFile {
            path,
            purpose,
            contents: String::new(),
        });
    }

    fn take_commands_block(&mut self, start: usize) {
        let Some(close) = self.buffer[start..].find(COMMANDS_CLOSE) else {
            self.buffer.drain(..start);
            return;
        };
        let body_start = start + COMMANDS_OPEN.len();
        let body = self.buffer[body_start..start + close].to_string();
        self.buffer.drain(..start + close + COMMANDS_CLOSE.len());
        for line in body.lines() {
            let line = line.trim();
            if !line.is_empty() {
                self.commands.push(line.to_string());
            }
        }
    }

    fn trim_prose(&mut self) {
        // Keep only a tail that could still grow into an opening tag.
        if let Some(idx) = self.buffer.rfind('<') {
            let tail = &self.buffer[idx..];
            if FILE_OPEN.starts_with(tail) || COMMANDS_OPEN.starts_with(tail) {
                self.buffer.drain(..idx);
                return;
            }
        }
        self.buffer.clear();
    }

    fn drain_file_body(&mut self, events: &mut Vec<FileEvent>) {
        let current = self.current.as_mut().expect("inside file block");
        if let Some(close) = self.buffer.find(FILE_CLOSE) {
            let body = self.buffer[..close].to_string();
            self.buffer.drain(..close + FILE_CLOSE.len());
            if !body.is_empty() {
                current.contents.push_str(&body);
                events.push(FileEvent::Chunk {
                    path: current.path.clone(),
                    delta: body,
                });
            }
            let finished = self.current.take().expect("inside file block");
            events.push(complete_event(finished));
        } else {
            // Hold back a tail that might be the start of the closing tag.
            let safe = self
                .buffer
                .len()
                .saturating_sub(FILE_CLOSE.len().saturating_sub(1));
            let cut = floor_char_boundary(&self.buffer, safe);
            if cut > 0 {
                let delta: String = self.buffer.drain(..cut).collect();
                current.contents.push_str(&delta);
                events.push(FileEvent::Chunk {
                    path: current.path.clone(),
                    delta,
                });
            }
        }
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn complete_event(current: CurrentFile) -> FileEvent {
    let mut contents = current.contents;
    if contents.ends_with('\n') {
        contents.pop();
    }
    FileEvent::Completed {
        file: GeneratedFile::new(current.path, contents).with_purpose(current.purpose),
    }
}

/// Inputs for one phase implementation.
#[derive(Debug, Clone)]
pub struct ImplementPhaseRequest {
    pub phase: PhaseConcept,
    pub issues: Vec<AnalysisIssue>,
    pub is_first_phase: bool,
    pub user_context: UserContext,
}

/// Result of one phase implementation.
pub struct ImplementedPhase {
    pub files: Vec<GeneratedFile>,
    pub commands: Vec<String>,
    pub deployment_needed: bool,
    /// Realtime per-file fixing tasks; await before saving so fixes land in
    /// the phase commit.
    pub fixed_file_handles: Vec<JoinHandle<GeneratedFile>>,
}

const SYSTEM_PROMPT: &str = "You implement one phase of a web application. Emit every file as \
<file path=\"...\" purpose=\"...\">\n...complete file contents...\n</file> and finish with an \
optional <commands>\none shell command per line\n</commands> block for packages to install. \
Always emit complete files, never fragments.";

/// Implement a phase, emitting protocol events as files stream in. With
/// `realtime_fixing`, each completed file is fixed concurrently.
pub async fn implement_phase(
    ctx: &OperationContext,
    request: ImplementPhaseRequest,
    realtime_fixing: bool,
    on_event: &(dyn Fn(AgentEvent) + Send + Sync),
) -> AppResult<ImplementedPhase> {
    let manifest: Vec<String> = request
        .phase
        .files
        .iter()
        .map(|f| {
            format!(
                "- {} - {}{}",
                f.path,
                f.purpose,
                f.changes
                    .as_deref()
                    .map(|c| format!(" (changes: {c})"))
                    .unwrap_or_default()
            )
        })
        .collect();
    let mut prompt = format!(
        "Phase: {}\n{}\n\nFiles to produce:\n{}\n\nExisting files:\n{}\n",
        request.phase.name,
        request.phase.description,
        manifest.join("\n"),
        ctx.file_inventory(),
    );
    if request.is_first_phase {
        prompt.push_str("\nThis is the first phase: produce a deployable skeleton.\n");
    }
    if !request.issues.is_empty() {
        let issues: Vec<String> = request
            .issues
            .iter()
            .map(|i| format!("- [{}] {}", i.code, i.message))
            .collect();
        prompt.push_str(&format!("\nFix these issues while implementing:\n{}\n", issues.join("\n")));
    }
    if !request.user_context.suggestions.is_empty() {
        prompt.push_str(&format!(
            "\nUser requests:\n{}\n",
            request.user_context.suggestions.join("\n")
        ));
    }

    let mut parser = FileStreamParser::new();
    let mut files: Vec<GeneratedFile> = Vec::new();
    let mut handles: Vec<JoinHandle<GeneratedFile>> = Vec::new();

    let phase_files = request.phase.files.clone();
    let provider = ctx.provider.clone();
    let cancel = ctx.cancel.clone();

    {
        let mut handle_events = |events: Vec<FileEvent>| {
            for event in events {
                match event {
                    FileEvent::Started { path, purpose } => {
                        on_event(AgentEvent::FileGenerating { path, purpose });
                    }
                    FileEvent::Chunk { path, delta } => {
                        on_event(AgentEvent::FileChunkGenerated { path, chunk: delta });
                    }
                    FileEvent::Completed { mut file } => {
                        if file.purpose.is_empty() {
                            if let Some(concept) =
                                phase_files.iter().find(|f| f.path == file.path)
                            {
                                file.purpose = concept.purpose.clone();
                            }
                        }
                        on_event(AgentEvent::FileGenerated {
                            path: file.path.clone(),
                            purpose: file.purpose.clone(),
                        });
                        if realtime_fixing {
                            let provider = provider.clone();
                            let cancel = cancel.clone();
                            let candidate = file.clone();
                            handles.push(tokio::spawn(async move {
                                fast_fixer::fix_single_file(provider, candidate, cancel).await
                            }));
                        }
                        files.push(file);
                    }
                }
            }
        };

        stream_with_chunks(
            &ctx.provider,
            vec![Message::user(prompt)],
            Some(SYSTEM_PROMPT.to_string()),
            Vec::new(),
            LlmRequestOptions {
                temperature: Some(0.2),
                max_tokens: None,
            },
            ctx.cancel.clone(),
            |chunk| {
                let events = parser.push(&chunk);
                handle_events(events);
            },
        )
        .await?;
        let tail = parser.finish();
        handle_events(tail);
    }

    let commands = parser.commands().to_vec();
    info!(
        phase = %request.phase.name,
        files = files.len(),
        commands = commands.len(),
        "phase implemented"
    );

    Ok(ImplementedPhase {
        deployment_needed: !files.is_empty(),
        files,
        commands,
        fixed_file_handles: handles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(parser: &mut FileStreamParser, chunks: &[&str]) -> Vec<FileEvent> {
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(parser.push(chunk));
        }
        events.extend(parser.finish());
        events
    }

    #[test]
    fn test_single_file_in_one_chunk() {
        let mut parser = FileStreamParser::new();
        let events = collect(
            &mut parser,
            &["<file path=\"src/App.tsx\" purpose=\"shell\">\nexport {}\n</file>"],
        );
        assert_eq!(
            events[0],
            FileEvent::Started {
                path: "src/App.tsx".to_string(),
                purpose: "shell".to_string()
            }
        );
        let FileEvent::Completed { file } = events.last().unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(file.contents, "export {}");
    }

    #[test]
    fn test_tag_split_across_chunks() {
        let mut parser = FileStreamParser::new();
        let events = collect(
            &mut parser,
            &[
                "Here we go <fi",
                "le path=\"a.ts\" purpose=\"x\">\nlet a ",
                "= 1;\n</fi",
                "le>",
            ],
        );
        let started = events
            .iter()
            .filter(|e| matches!(e, FileEvent::Started { .. }))
            .count();
        assert_eq!(started, 1);
        let FileEvent::Completed { file } = events.last().unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(file.path, "a.ts");
        assert_eq!(file.contents, "let a = 1;");
    }

    #[test]
    fn test_chunks_are_ordered_within_a_path() {
        let mut parser = FileStreamParser::new();
        let mut events = Vec::new();
        events.extend(parser.push("<file path=\"a.ts\" purpose=\"x\">\n"));
        events.extend(parser.push("line one that is long enough\n"));
        events.extend(parser.push("line two also long enough\n"));
        events.extend(parser.push("</file>"));
        events.extend(parser.finish());

        let mut reassembled = String::new();
        for event in &events {
            if let FileEvent::Chunk { delta, .. } = event {
                reassembled.push_str(delta);
            }
        }
        let FileEvent::Completed { file } = events.last().unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(reassembled.trim_end(), file.contents);
    }

    #[test]
    fn test_multiple_files_and_commands() {
        let mut parser = FileStreamParser::new();
        let events = collect(
            &mut parser,
            &[
                "<file path=\"a.ts\" purpose=\"one\">\na\n</file>\n",
                "<file path=\"b.ts\" purpose=\"two\">\nb\n</file>\n",
                "<commands>\nbun add zod\nbun add hono\n</commands>",
            ],
        );
        let completed: Vec<&GeneratedFile> = events
            .iter()
            .filter_map(|e| match e {
                FileEvent::Completed { file } => Some(file),
                _ => None,
            })
            .collect();
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[1].purpose, "two");
        assert_eq!(parser.commands(), &["bun add zod", "bun add hono"]);
    }

    #[test]
    fn test_unterminated_file_completes_on_finish() {
        let mut parser = FileStreamParser::new();
        let events = collect(
            &mut parser,
            &["<file path=\"a.ts\" purpose=\"x\">\npartial contents"],
        );
        let FileEvent::Completed { file } = events.last().unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(file.contents, "partial contents");
    }

    #[test]
    fn test_prose_outside_blocks_is_ignored() {
        let mut parser = FileStreamParser::new();
        let events = collect(
            &mut parser,
            &["I will now create the files.\n\n<file path=\"a.ts\" purpose=\"x\">\na\n</file> Done!"],
        );
        assert!(matches!(events[0], FileEvent::Started { .. }));
        assert_eq!(events.len(), 3);
    }
}
