use crate::config::MemoryConfig;
use crate::models::Turn;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Buffer,
    Window,
}

/// Ordered record of answered turns replayed into every prompt.
pub trait MemoryStore: Send + Sync {
    fn history(&self) -> &[Turn];

    fn append(&mut self, turn: Turn);

    fn clear(&mut self);

    fn len(&self) -> usize {
        self.history().len()
    }

    fn is_empty(&self) -> bool {
        self.history().is_empty()
    }
}

impl<M: MemoryStore + ?Sized> MemoryStore for Box<M> {
    fn history(&self) -> &[Turn] {
        (**self).history()
    }

    fn append(&mut self, turn: Turn) {
        (**self).append(turn)
    }

    fn clear(&mut self) {
        (**self).clear()
    }
}

pub fn memory_from_config(config: &MemoryConfig) -> Box<dyn MemoryStore> {
    match config.kind {
        MemoryKind::Buffer => Box::new(BufferMemory::default()),
        MemoryKind::Window => Box::new(WindowMemory::new(config.max_turns)),
    }
}

/// Keeps every turn for the lifetime of the session.
#[derive(Debug, Clone, Default)]
pub struct BufferMemory {
    turns: Vec<Turn>,
}

impl MemoryStore for BufferMemory {
    fn history(&self) -> &[Turn] {
        &self.turns
    }

    fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    fn clear(&mut self) {
        self.turns.clear();
    }
}

/// Keeps the most recent `max_turns` turns.
#[derive(Debug, Clone)]
pub struct WindowMemory {
    turns: Vec<Turn>,
    max_turns: usize,
}

impl WindowMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: Vec::new(),
            max_turns: max_turns.max(1),
        }
    }
}

impl MemoryStore for WindowMemory {
    fn history(&self) -> &[Turn] {
        &self.turns
    }

    fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
        if self.turns.len() > self.max_turns {
            let overflow = self.turns.len() - self.max_turns;
            self.turns.drain(..overflow);
        }
    }

    fn clear(&mut self) {
        self.turns.clear();
    }
}
