//! Bounded buffer of the most recent diagnostic lines.

use std::collections::VecDeque;

/// Keeps the last lines written by a tool, bounded to a byte budget.
///
/// Older lines are evicted first. A single line longer than the budget is
/// truncated to its trailing bytes so the buffer never exceeds the budget.
#[derive(Debug, Clone)]
pub struct DiagnosticTail {
    lines: VecDeque<String>,
    bytes: usize,
    budget: usize,
    evicted: bool,
}

impl DiagnosticTail {
    pub fn new(budget: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            budget,
            evicted: false,
        }
    }

    pub fn push(&mut self, line: &str) {
        if self.budget == 0 {
            self.evicted = true;
            return;
        }

        let line = if line.len() > self.budget {
            self.evicted = true;
            let mut start = line.len() - self.budget;
            while !line.is_char_boundary(start) {
                start += 1;
            }
            &line[start..]
        } else {
            line
        };

        self.bytes += line.len();
        self.lines.push_back(line.to_string());

        while self.bytes > self.budget {
            match self.lines.pop_front() {
                Some(old) => {
                    self.bytes -= old.len();
                    self.evicted = true;
                }
                None => break,
            }
        }
    }

    /// Bytes currently retained (line contents only).
    pub fn len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Whether older output was dropped to stay within budget.
    pub fn was_truncated(&self) -> bool {
        self.evicted
    }

    pub fn render(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}
