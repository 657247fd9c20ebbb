//! Stack-trace parsing

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;

/// One parsed frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    pub function: Option<String>,
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
    /// Inside `node_modules/` or `vendor/`
    pub is_dependency: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedStackTrace {
    pub frames: Vec<StackFrame>,
    /// First frame in project code
    pub primary_frame: Option<StackFrame>,
    /// Parent directory name of the primary frame's file
    pub primary_module: Option<String>,
}

static FRAME_RE: OnceLock<Regex> = OnceLock::new();

fn frame_regex() -> &'static Regex {
    // `at fn (file:line:col)`, `at file:line:col`, or a bare `file:line[:col]`
    FRAME_RE.get_or_init(|| {
        Regex::new(
            r"^\s*(?:at\s+)?(?:(?:async\s+|new\s+)?(?P<func>[^\s()]+(?:\s\[as [^\]]+\])?)\s+\()?(?P<file>[^\s()]+?):(?P<line>\d+)(?::(?P<col>\d+))?\)?\s*$",
        )
        .expect("frame regex is a valid literal")
    })
}

fn is_internal(file: &str) -> bool {
    file.starts_with("node:") || file.starts_with("internal/") || file.contains("/internal/")
}

fn is_dependency(file: &str) -> bool {
    let normalized = file.replace('\\', "/");
    normalized
        .split('/')
        .any(|segment| segment == "node_modules" || segment == "vendor")
}

/// Extract frames from raw trace text, dropping runtime-internal frames.
pub fn parse_stack_trace(trace: &str) -> ParsedStackTrace {
    let re = frame_regex();

    let frames: Vec<StackFrame> = trace
        .lines()
        .filter_map(|line| {
            let caps = re.captures(line)?;
            let file = caps.name("file")?.as_str().to_string();
            if is_internal(&file) {
                return None;
            }
            Some(StackFrame {
                function: caps.name("func").map(|m| m.as_str().to_string()),
                line: caps.name("line")?.as_str().parse().ok()?,
                column: caps.name("col").and_then(|m| m.as_str().parse().ok()),
                is_dependency: is_dependency(&file),
                file,
            })
        })
        .collect();

    let primary_frame = frames.iter().find(|f| !f.is_dependency).cloned();
    let primary_module = primary_frame.as_ref().and_then(|frame| {
        let normalized = frame.file.replace('\\', "/");
        Path::new(&normalized)
            .parent()
            .and_then(|p| p.file_name())
            .map(|name| name.to_string_lossy().to_string())
    });

    ParsedStackTrace {
        frames,
        primary_frame,
        primary_module,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODE_TRACE: &str = "TypeError: Cannot read properties of undefined (reading 'id')
    at Object.handler (/app/node_modules/express/lib/router/layer.js:95:5)
    at getUser (/app/src/services/user.ts:42:17)
    at async run (/app/src/index.ts:10:3)
    at Module._compile (node:internal/modules/cjs/loader:1256:14)
    at processTicksAndRejections (internal/process/task_queues.js:95:5)";

    #[test]
    fn test_parses_node_frames_and_drops_internals() {
        let parsed = parse_stack_trace(NODE_TRACE);
        assert_eq!(parsed.frames.len(), 3);

        let first = &parsed.frames[0];
        assert_eq!(first.function.as_deref(), Some("Object.handler"));
        assert!(first.is_dependency);

        let run = &parsed.frames[2];
        assert_eq!(run.function.as_deref(), Some("run"));
        assert_eq!(run.line, 10);
        assert_eq!(run.column, Some(3));
    }

    #[test]
    fn test_primary_frame_skips_dependencies() {
        let parsed = parse_stack_trace(NODE_TRACE);
        let primary = parsed.primary_frame.unwrap();
        assert_eq!(primary.file, "/app/src/services/user.ts");
        assert_eq!(primary.line, 42);
        assert_eq!(parsed.primary_module.as_deref(), Some("services"));
    }

    #[test]
    fn test_bare_file_line_frames() {
        let parsed = parse_stack_trace("error happened\nsrc/parser/lexer.rs:88:12\nvendor/lib.c:10");
        assert_eq!(parsed.frames.len(), 2);
        assert!(parsed.frames[0].function.is_none());
        assert_eq!(parsed.primary_module.as_deref(), Some("parser"));
        assert!(parsed.frames[1].is_dependency);
        assert_eq!(parsed.frames[1].column, None);
    }

    #[test]
    fn test_no_frames() {
        let parsed = parse_stack_trace("plain message without location");
        assert!(parsed.frames.is_empty());
        assert!(parsed.primary_frame.is_none());
        assert!(parsed.primary_module.is_none());
    }
}
