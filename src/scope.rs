//! Assignment scope stack
//!
//! Frames hold variables that are only visible while one command (or one
//! loop iteration) is evaluated. Each executor owns its own stack; nothing is
//! shared between commands that may run concurrently.

use serde_json::Value;

use crate::command::Assignments;

pub type Frame = Assignments;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeStack {
    frames: Vec<Frame>,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Set a variable in the innermost frame, opening one if needed
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        if self.frames.is_empty() {
            self.frames.push(Frame::new());
        }
        if let Some(top) = self.frames.last_mut() {
            top.insert(name.into(), value);
        }
    }

    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// Innermost binding of `name`
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.frames.iter().rev().find_map(|frame| frame.get(name))
    }

    /// Merge all frames, inner frames overriding outer ones
    pub fn flatten(&self) -> Frame {
        let mut merged = Frame::new();
        for frame in &self.frames {
            for (name, value) in frame {
                merged.insert(name.clone(), value.clone());
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(pairs: &[(&str, Value)]) -> Frame {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_push_pop() {
        let mut scope = ScopeStack::new();
        scope.push(frame(&[("A", json!("1"))]));
        assert_eq!(scope.depth(), 1);
        assert_eq!(scope.pop(), Some(frame(&[("A", json!("1"))])));
        assert_eq!(scope.pop(), None);
    }

    #[test]
    fn test_lookup_innermost_first() {
        let mut scope = ScopeStack::new();
        scope.push(frame(&[("A", json!("outer")), ("B", json!("b"))]));
        scope.push(frame(&[("A", json!("inner"))]));
        assert_eq!(scope.lookup("A"), Some(&json!("inner")));
        assert_eq!(scope.lookup("B"), Some(&json!("b")));
        assert_eq!(scope.lookup("C"), None);

        scope.pop();
        assert_eq!(scope.lookup("A"), Some(&json!("outer")));
    }

    #[test]
    fn test_flatten_inner_wins() {
        let mut scope = ScopeStack::new();
        scope.push(frame(&[("A", json!(1)), ("B", json!(2))]));
        scope.push(frame(&[("B", json!(3))]));
        assert_eq!(scope.flatten(), frame(&[("A", json!(1)), ("B", json!(3))]));
    }

    #[test]
    fn test_clone_is_independent() {
        let mut scope = ScopeStack::new();
        scope.push(frame(&[("A", json!(1))]));
        let mut copy = scope.clone();
        copy.set("A", json!(2));
        copy.push(Frame::new());
        assert_eq!(scope.lookup("A"), Some(&json!(1)));
        assert_eq!(scope.depth(), 1);
        assert_eq!(copy.depth(), 2);
    }

    #[test]
    fn test_set_opens_frame() {
        let mut scope = ScopeStack::new();
        scope.set("X", json!("x"));
        assert_eq!(scope.depth(), 1);
        assert_eq!(scope.top(), Some(&frame(&[("X", json!("x"))])));
    }
}
