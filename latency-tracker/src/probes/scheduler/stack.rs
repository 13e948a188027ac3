use std::fmt;
use std::fs;

use latency_tracker_common::MAX_STACK_TXT;

/// Stack text truncated to [`MAX_STACK_TXT`] bytes, one frame per line.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct StackText {
    text: String,
}

impl StackText {
    /// Appends frames until the next one no longer fits.
    pub fn from_frames<'a, I>(frames: I, skip: usize) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut text = String::new();
        for frame in frames.into_iter().skip(skip) {
            let frame = frame.trim();
            if frame.is_empty() {
                continue;
            }
            if text.len() + frame.len() + 1 > MAX_STACK_TXT {
                break;
            }
            text.push_str(frame);
            text.push('\n');
        }
        Self { text }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

impl fmt::Debug for StackText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.text)
    }
}

/// Captures a diagnostic call-stack snapshot for a task.
pub trait ContextCapture: Send + Sync {
    /// `skip` drops that many innermost frames.
    fn capture(&self, pid: u32, skip: usize) -> StackText;
}

/// Reads the kernel stack from `/proc/<pid>/stack`, falling back to the
/// wait channel when the stack file is not readable (it requires
/// CAP_SYS_ADMIN).
#[derive(Debug, Default)]
pub struct ProcStackCapture;

impl ContextCapture for ProcStackCapture {
    fn capture(&self, pid: u32, skip: usize) -> StackText {
        if let Ok(raw) = fs::read_to_string(format!("/proc/{}/stack", pid)) {
            return StackText::from_frames(raw.lines().map(strip_frame_address), skip);
        }
        match fs::read_to_string(format!("/proc/{}/wchan", pid)) {
            Ok(wchan) if !wchan.is_empty() && wchan != "0" => {
                StackText::from_frames([wchan.as_str()], 0)
            }
            _ => StackText::default(),
        }
    }
}

/// `[<0>] do_nanosleep+0x6d/0x150` -> `do_nanosleep+0x6d/0x150`
fn strip_frame_address(line: &str) -> &str {
    match line.trim_start().strip_prefix('[') {
        Some(rest) => rest.split_once(']').map_or(line, |(_, frame)| frame),
        None => line,
    }
}

/// Capture that never produces frames.
#[derive(Debug, Default)]
pub struct NoCapture;

impl ContextCapture for NoCapture {
    fn capture(&self, _pid: u32, _skip: usize) -> StackText {
        StackText::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_bounded() {
        let frame = "x".repeat(100);
        let frames = vec![frame.as_str(); 10];
        let stack = StackText::from_frames(frames, 0);
        assert!(stack.as_str().len() <= MAX_STACK_TXT);
        assert_eq!(stack.as_str().lines().count(), 2);
    }

    #[test]
    fn skip_drops_innermost_frames() {
        let stack = StackText::from_frames(["a", "b", "c", "d"], 3);
        assert_eq!(stack.as_str(), "d\n");
    }

    #[test]
    fn kernel_stack_lines_lose_address_prefix() {
        assert_eq!(
            strip_frame_address("[<0>] do_nanosleep+0x6d/0x150"),
            " do_nanosleep+0x6d/0x150"
        );
        assert_eq!(strip_frame_address("schedule"), "schedule");
    }

    #[test]
    fn missing_task_yields_empty_stack() {
        assert!(ProcStackCapture.capture(u32::MAX, 0).is_empty());
    }
}
