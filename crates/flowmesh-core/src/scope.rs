// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Hierarchical name-resolution scope for expressions.
//!
//! A scope is a stack of frames. The outermost frame carries the merged
//! execution variables (`env`, `vars`) and accumulated step outputs
//! (`steps`); inner frames are pushed for `for_each` iterations and
//! sub-flow inputs. Name resolution walks inner-to-outer.

use serde_json::{Map, Value};

/// Nested variable frames with inner-to-outer lookup.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    frames: Vec<Map<String, Value>>,
}

impl Scope {
    /// Creates a scope with a single empty root frame.
    pub fn new() -> Self {
        Self { frames: vec![Map::new()] }
    }

    /// Creates a scope whose root frame holds the given entries.
    pub fn with_root(root: Map<String, Value>) -> Self {
        Self { frames: vec![root] }
    }

    /// Pushes a new innermost frame.
    pub fn push_frame(&mut self, frame: Map<String, Value>) {
        self.frames.push(frame);
    }

    /// Pops the innermost frame. The root frame is never popped.
    pub fn pop_frame(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    /// Number of frames, the root included.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Sets a name in the innermost frame.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.into(), value);
        }
    }

    /// Sets a name in the root frame, visible from every inner frame.
    pub fn set_root(&mut self, name: impl Into<String>, value: Value) {
        if let Some(frame) = self.frames.first_mut() {
            frame.insert(name.into(), value);
        }
    }

    /// Resolves a name, walking frames inner-to-outer.
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.frames.iter().rev().find_map(|frame| frame.get(name))
    }

    /// Records a completed step's bindings under `steps.<step_id>`.
    pub fn bind_step(&mut self, step_id: &str, bindings: Value) {
        let root = match self.frames.first_mut() {
            Some(f) => f,
            None => return,
        };
        let steps = root
            .entry("steps".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = steps {
            map.insert(step_id.to_string(), bindings);
        }
    }

    /// Snapshot of the merged view, innermost names winning.
    ///
    /// Used by the debugger when publishing pause snapshots.
    pub fn flatten(&self) -> Map<String, Value> {
        let mut merged = Map::new();
        for frame in &self.frames {
            for (k, v) in frame {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inner_frames_shadow_outer() {
        let mut scope = Scope::new();
        scope.set("x", json!(1));
        let mut frame = Map::new();
        frame.insert("x".to_string(), json!(2));
        scope.push_frame(frame);
        assert_eq!(scope.lookup("x"), Some(&json!(2)));
        scope.pop_frame();
        assert_eq!(scope.lookup("x"), Some(&json!(1)));
    }

    #[test]
    fn root_frame_survives_pop() {
        let mut scope = Scope::new();
        scope.set("x", json!(1));
        scope.pop_frame();
        assert_eq!(scope.lookup("x"), Some(&json!(1)));
    }

    #[test]
    fn step_bindings_accumulate() {
        let mut scope = Scope::new();
        scope.bind_step("login", json!({"output": {"token": "abc"}}));
        scope.bind_step("me", json!({"output": {"id": 7}}));
        let steps = scope.lookup("steps").unwrap();
        assert_eq!(steps["login"]["output"]["token"], json!("abc"));
        assert_eq!(steps["me"]["output"]["id"], json!(7));
    }

    #[test]
    fn set_root_is_visible_from_inner_frames() {
        let mut scope = Scope::new();
        scope.push_frame(Map::new());
        scope.set_root("env", json!({"BASE_URL": "http://x"}));
        assert_eq!(scope.lookup("env").unwrap()["BASE_URL"], json!("http://x"));
    }
}
