//! Input injection capability and pressed-state tracking.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rc_protocol::{InputEvent, MouseButton};

use crate::error::StreamError;

/// Platform input injection.
///
/// Handlers run on the transport callback thread and must not block; the
/// underlying platform calls are fire-and-forget.
pub trait InputHandler: Send {
    /// Inject one viewer input event.
    fn handle(&mut self, event: &InputEvent) -> Result<(), StreamError>;

    /// Release every modifier key. Called at teardown so a dropped viewer
    /// never leaves Ctrl or Alt held on the host.
    fn release_all_modifiers(&mut self);

    /// Invisible one-pixel pointer wiggle. Credential providers on a
    /// freshly entered secure desktop don't render until they see input.
    fn jiggle_pointer(&mut self);
}

/// Tracks pressed keys and mouse buttons with timestamps, so sessions can
/// detect and release input stuck by a dropped connection.
pub struct KeyTracker {
    pressed_keys: HashMap<String, Instant>,
    pressed_buttons: HashMap<MouseButton, Instant>,
}

impl KeyTracker {
    pub fn new() -> Self {
        Self {
            pressed_keys: HashMap::new(),
            pressed_buttons: HashMap::new(),
        }
    }

    /// Update tracking from an input event as it is dispatched.
    pub fn observe(&mut self, event: &InputEvent) {
        match event {
            InputEvent::KeyDown { key, .. } => {
                self.pressed_keys.insert(key.clone(), Instant::now());
            }
            InputEvent::KeyUp { key, .. } => {
                self.pressed_keys.remove(key);
            }
            InputEvent::MouseDown { button, .. } => {
                self.pressed_buttons.insert(*button, Instant::now());
            }
            InputEvent::MouseUp { button, .. } => {
                self.pressed_buttons.remove(button);
            }
            _ => {}
        }
    }

    /// Keys held longer than `max_held`.
    pub fn stuck_keys(&self, max_held: Duration) -> Vec<String> {
        let now = Instant::now();
        self.pressed_keys
            .iter()
            .filter(|(_, ts)| now.duration_since(**ts) > max_held)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Everything currently held, for release at teardown.
    pub fn held(&self) -> (Vec<String>, Vec<MouseButton>) {
        (
            self.pressed_keys.keys().cloned().collect(),
            self.pressed_buttons.keys().copied().collect(),
        )
    }

    pub fn clear(&mut self) {
        self.pressed_keys.clear();
        self.pressed_buttons.clear();
    }
}

impl Default for KeyTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Synthesize the release events for everything `tracker` still holds and
/// dispatch them through `handler`, then drop the modifiers for good
/// measure.
pub fn release_held_input(tracker: &mut KeyTracker, handler: &mut dyn InputHandler) {
    let (keys, buttons) = tracker.held();
    for key in keys {
        let _ = handler.handle(&InputEvent::KeyUp {
            key,
            modifiers: vec![],
        });
    }
    for button in buttons {
        let _ = handler.handle(&InputEvent::MouseUp {
            x: 0,
            y: 0,
            button,
        });
    }
    handler.release_all_modifiers();
    tracker.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingHandler {
        events: Vec<InputEvent>,
        releases: u32,
    }

    impl InputHandler for RecordingHandler {
        fn handle(&mut self, event: &InputEvent) -> Result<(), StreamError> {
            self.events.push(event.clone());
            Ok(())
        }

        fn release_all_modifiers(&mut self) {
            self.releases += 1;
        }

        fn jiggle_pointer(&mut self) {}
    }

    #[test]
    fn test_tracker_follows_press_release() {
        let mut tracker = KeyTracker::new();
        tracker.observe(&InputEvent::KeyDown {
            key: "a".into(),
            modifiers: vec![],
        });
        tracker.observe(&InputEvent::MouseDown {
            x: 5,
            y: 5,
            button: MouseButton::Left,
        });

        let (keys, buttons) = tracker.held();
        assert_eq!(keys, vec!["a".to_string()]);
        assert_eq!(buttons, vec![MouseButton::Left]);

        tracker.observe(&InputEvent::KeyUp {
            key: "a".into(),
            modifiers: vec![],
        });
        tracker.observe(&InputEvent::MouseUp {
            x: 5,
            y: 5,
            button: MouseButton::Left,
        });
        let (keys, buttons) = tracker.held();
        assert!(keys.is_empty());
        assert!(buttons.is_empty());
    }

    #[test]
    fn test_release_held_input_synthesizes_ups() {
        let mut tracker = KeyTracker::new();
        tracker.observe(&InputEvent::KeyDown {
            key: "Shift".into(),
            modifiers: vec![],
        });
        tracker.observe(&InputEvent::MouseDown {
            x: 0,
            y: 0,
            button: MouseButton::Right,
        });

        let mut handler = RecordingHandler {
            events: vec![],
            releases: 0,
        };
        release_held_input(&mut tracker, &mut handler);

        assert_eq!(handler.events.len(), 2);
        assert!(handler
            .events
            .iter()
            .any(|e| matches!(e, InputEvent::KeyUp { key, .. } if key == "Shift")));
        assert!(handler
            .events
            .iter()
            .any(|e| matches!(e, InputEvent::MouseUp { button: MouseButton::Right, .. })));
        assert_eq!(handler.releases, 1);

        let (keys, buttons) = tracker.held();
        assert!(keys.is_empty() && buttons.is_empty());
    }

    #[test]
    fn test_stuck_keys_threshold() {
        let mut tracker = KeyTracker::new();
        tracker.observe(&InputEvent::KeyDown {
            key: "x".into(),
            modifiers: vec![],
        });
        assert!(tracker.stuck_keys(Duration::from_secs(30)).is_empty());
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(tracker.stuck_keys(Duration::from_millis(1)).len(), 1);
    }
}
