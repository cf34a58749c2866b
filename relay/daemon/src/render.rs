//! Terminal rendering of a watched session
//!
//! Prints what a surface would draw: progress lines as steps change, the
//! streamed text as it grows, and every animation transition.

use std::collections::HashMap;
use std::io::Write;

use relay_core::{AnimationState, RenderParams, SessionView, StepStatus};

/// Prints the difference between successive session views
#[derive(Debug, Default)]
pub struct Renderer {
    printed: String,
    steps: HashMap<String, (StepStatus, u8)>,
    error_shown: bool,
    mid_line: bool,
}

impl Renderer {
    /// Print whatever changed since the last call
    pub fn view(&mut self, view: &SessionView) {
        for update in view.progress_entries() {
            let seen = (update.status, update.progress);
            if self.steps.get(&update.step) == Some(&seen) {
                continue;
            }
            self.steps.insert(update.step.clone(), seen);
            self.line(&format!(
                "[{:>3}%] {} ({:?}): {}",
                update.progress, update.step, update.status, update.message
            ));
        }

        let text = view.text();
        if let Some(delta) = text.strip_prefix(self.printed.as_str()) {
            if !delta.is_empty() {
                print!("{delta}");
                self.mid_line = true;
            }
        } else {
            // Buffer was reset for a new turn
            self.end_line();
            print!("{text}");
            self.mid_line = !text.is_empty();
        }
        self.printed = text.to_string();

        if let Some(error) = view.error() {
            if !self.error_shown {
                self.error_shown = true;
                let kind = if error.recoverable { "recoverable" } else { "fatal" };
                self.line(&format!("error ({kind}): {}", error.error));
            }
        }

        let _ = std::io::stdout().flush();
    }

    /// Print an animation transition with its render preset
    pub fn animation(&mut self, state: AnimationState) {
        let p = RenderParams::for_state(state);
        self.line(&format!(
            "~ {state} (focus {:.1}, speed {:.1}, aperture {:.1}, fov {:.1}, curl {:.2})",
            p.focus, p.speed, p.aperture, p.fov, p.curl
        ));
        let _ = std::io::stdout().flush();
    }

    fn line(&mut self, line: &str) {
        self.end_line();
        println!("{line}");
    }

    fn end_line(&mut self) {
        if self.mid_line {
            println!();
            self.mid_line = false;
        }
    }
}
