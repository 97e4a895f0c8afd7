use anyhow::{bail, Result};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::SamplingParams;
use crate::model::TextGenerator;
use crate::prompt::ChatMessage;

#[derive(Debug, Clone)]
pub enum Step {
    Emit(String),
    Fail(String),
    Sleep(Duration),
    Panic,
}

impl Step {
    pub fn emit(text: &str) -> Self {
        Step::Emit(text.to_string())
    }

    pub fn fail(message: &str) -> Self {
        Step::Fail(message.to_string())
    }
}

/// Replays a fixed script on every call and records what it was asked.
pub struct ScriptedGenerator {
    steps: Vec<Step>,
    active: Arc<AtomicUsize>,
    pub max_active: Arc<AtomicUsize>,
    pub stopped_early: Arc<AtomicBool>,
    pub seen: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

impl ScriptedGenerator {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
            stopped_early: Arc::new(AtomicBool::new(false)),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl TextGenerator for ScriptedGenerator {
    fn generate(
        &mut self,
        messages: &[ChatMessage],
        _params: &SamplingParams,
        emit: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.seen.lock().unwrap().push(messages.to_vec());

        let result = (|| {
            for step in &self.steps {
                match step {
                    Step::Emit(text) => {
                        if emit(text).is_break() {
                            self.stopped_early.store(true, Ordering::SeqCst);
                            return Ok(());
                        }
                    }
                    Step::Fail(message) => bail!("{}", message),
                    Step::Sleep(duration) => std::thread::sleep(*duration),
                    Step::Panic => panic!("scripted panic"),
                }
            }
            Ok(())
        })();

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
