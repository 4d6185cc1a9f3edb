//! # rc-protocol
//!
//! Shared wire types for the Remotecast streaming core.
//!
//! All three data channels (`input`, `control`, `cursor`) speak text JSON;
//! the types here are the single source of truth for their schemas. The
//! ICE server configuration consumed at session setup also lives here.

use serde::{Deserialize, Serialize};

/// Protocol version constant — bump on breaking wire changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Hard ceiling for viewer-requested bitrate (bps).
pub const MAX_BITRATE_BPS: u32 = 20_000_000;

/// Hard ceiling for viewer-requested frame rate.
pub const MAX_FPS: u32 = 60;

/// Default STUN server used when no ICE servers are configured.
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

// ─── Input channel ──────────────────────────────────────────────────

/// Mouse button identifier as sent by viewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

/// Keyboard modifier held during an input event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modifier {
    Ctrl,
    Alt,
    Shift,
    Meta,
}

/// A single viewer input event, tagged by `type`.
///
/// Coordinates are absolute pixels within the captured display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputEvent {
    MouseMove {
        x: i32,
        y: i32,
    },
    MouseClick {
        x: i32,
        y: i32,
        button: MouseButton,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        modifiers: Vec<Modifier>,
    },
    MouseDown {
        x: i32,
        y: i32,
        button: MouseButton,
    },
    MouseUp {
        x: i32,
        y: i32,
        button: MouseButton,
    },
    MouseScroll {
        x: i32,
        y: i32,
        /// Positive scrolls up, negative scrolls down.
        delta: f64,
    },
    KeyPress {
        key: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        modifiers: Vec<Modifier>,
    },
    KeyDown {
        key: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        modifiers: Vec<Modifier>,
    },
    KeyUp {
        key: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        modifiers: Vec<Modifier>,
    },
}

// ─── Control channel ────────────────────────────────────────────────

/// A viewer request on the control channel: `{"type": ..., "value": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Requested video bitrate in bps (capped at [`MAX_BITRATE_BPS`]).
    SetBitrate { value: u32 },
    /// Requested frame rate (capped at [`MAX_FPS`]).
    SetFps { value: u32 },
    RequestKeyframe,
    /// 1 enables audio, 0 disables it.
    ToggleAudio { value: u8 },
    ListMonitors,
    SendSas,
    LockWorkstation,
    /// Switch capture to the display with this index.
    SwitchMonitor { value: u32 },
}

/// An agent reply on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlReply {
    Monitors {
        monitors: Vec<MonitorInfo>,
    },
    SasResult {
        ok: bool,
        #[serde(rename = "verificationSupported")]
        verification_supported: bool,
        verified: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    LockResult {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    MonitorSwitched {
        index: u32,
        width: u32,
        height: u32,
    },
    /// Unsolicited notice: the host moved to or from a secure desktop, or
    /// the capture resolution changed underneath the stream.
    DesktopSwitch {
        secure: bool,
        width: u32,
        height: u32,
    },
}

// ─── Cursor channel ─────────────────────────────────────────────────

/// Cursor position update, sent only on change.
///
/// Coordinates are relative to the captured display's origin; `v` is 1
/// when the cursor is visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorUpdate {
    pub x: i32,
    pub y: i32,
    pub v: u8,
}

// ─── Monitors ───────────────────────────────────────────────────────

/// One connected display, as reported to viewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorInfo {
    pub index: u32,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub x: i32,
    pub y: i32,
    #[serde(rename = "isPrimary")]
    pub is_primary: bool,
}

// ─── ICE configuration ──────────────────────────────────────────────

/// One or many STUN/TURN URLs — viewers may send either form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IceUrls {
    One(String),
    Many(Vec<String>),
}

/// ICE server entry as it appears in session setup payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: IceUrls,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Normalized ICE server, ready to hand to the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// Normalize configured ICE servers; an empty configuration yields the
/// single default STUN server.
pub fn parse_ice_servers(configs: &[IceServerConfig]) -> Vec<IceServer> {
    if configs.is_empty() {
        return vec![IceServer {
            urls: vec![DEFAULT_STUN_URL.to_string()],
            username: String::new(),
            credential: String::new(),
        }];
    }

    configs
        .iter()
        .map(|c| {
            let urls = match &c.urls {
                IceUrls::One(url) => vec![url.clone()],
                IceUrls::Many(urls) => urls.clone(),
            };
            IceServer {
                urls,
                username: c.username.clone().unwrap_or_default(),
                credential: c.credential.clone().unwrap_or_default(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_event_roundtrip() {
        let json = r#"{"type":"mouse_down","x":120,"y":40,"button":"left"}"#;
        let event: InputEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            InputEvent::MouseDown {
                x: 120,
                y: 40,
                button: MouseButton::Left
            }
        );

        let back = serde_json::to_string(&event).unwrap();
        let again: InputEvent = serde_json::from_str(&back).unwrap();
        assert_eq!(event, again);
    }

    #[test]
    fn test_key_event_modifiers_default_empty() {
        let event: InputEvent = serde_json::from_str(r#"{"type":"key_press","key":"a"}"#).unwrap();
        assert_eq!(
            event,
            InputEvent::KeyPress {
                key: "a".to_string(),
                modifiers: vec![]
            }
        );

        let event: InputEvent =
            serde_json::from_str(r#"{"type":"key_down","key":"Tab","modifiers":["ctrl","shift"]}"#)
                .unwrap();
        assert_eq!(
            event,
            InputEvent::KeyDown {
                key: "Tab".to_string(),
                modifiers: vec![Modifier::Ctrl, Modifier::Shift]
            }
        );
    }

    #[test]
    fn test_control_request_parse() {
        let req: ControlRequest =
            serde_json::from_str(r#"{"type":"set_bitrate","value":4000000}"#).unwrap();
        assert_eq!(req, ControlRequest::SetBitrate { value: 4_000_000 });

        let req: ControlRequest = serde_json::from_str(r#"{"type":"request_keyframe"}"#).unwrap();
        assert_eq!(req, ControlRequest::RequestKeyframe);

        let req: ControlRequest =
            serde_json::from_str(r#"{"type":"switch_monitor","value":1}"#).unwrap();
        assert_eq!(req, ControlRequest::SwitchMonitor { value: 1 });
    }

    #[test]
    fn test_sas_reply_field_names() {
        let reply = ControlReply::SasResult {
            ok: true,
            verification_supported: true,
            verified: false,
            warning: None,
            error: None,
        };
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains(r#""type":"sas_result""#));
        assert!(json.contains(r#""verificationSupported":true"#));
        assert!(!json.contains("warning"));
    }

    #[test]
    fn test_cursor_update_shape() {
        let update = CursorUpdate { x: 10, y: -3, v: 1 };
        assert_eq!(
            serde_json::to_string(&update).unwrap(),
            r#"{"x":10,"y":-3,"v":1}"#
        );
    }

    #[test]
    fn test_parse_ice_servers_default() {
        let servers = parse_ice_servers(&[]);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec![DEFAULT_STUN_URL.to_string()]);
        assert!(servers[0].username.is_empty());
        assert!(servers[0].credential.is_empty());
    }

    #[test]
    fn test_parse_ice_servers_one_or_many() {
        let configs: Vec<IceServerConfig> = serde_json::from_str(
            r#"[
                {"urls": "stun:stun.example.org:3478"},
                {"urls": ["turn:turn.example.org:3478"], "username": "u", "credential": "c"}
            ]"#,
        )
        .unwrap();

        let servers = parse_ice_servers(&configs);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.org:3478"]);
        assert_eq!(servers[1].urls, vec!["turn:turn.example.org:3478"]);
        assert_eq!(servers[1].username, "u");
        assert_eq!(servers[1].credential, "c");
    }
}
