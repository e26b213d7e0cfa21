//! Host events
//!
//! Everything the host can deliver to an instance, already decoded into
//! plain values. The bridge never interprets payloads; it only orders them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque handle to a host-side resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource(pub i32);

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Position, size and visibility of the instance on the page
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct View {
    pub rect: Rect,
    pub clip_rect: Rect,
    pub fullscreen: bool,
    pub visible: bool,
    pub page_visible: bool,
    pub css_scale: f32,
    pub device_scale: f32,
}

impl Default for View {
    fn default() -> Self {
        Self {
            rect: Rect::default(),
            clip_rect: Rect::default(),
            fullscreen: false,
            visible: true,
            page_visible: true,
            css_scale: 1.0,
            device_scale: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modifiers {
    pub shift: bool,
    pub ctrl: bool,
    pub alt: bool,
    pub meta: bool,
}

/// Input events from the browser
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputEvent {
    /// Key pressed
    KeyDown { key: String, code: String, modifiers: Modifiers },
    /// Key released
    KeyUp { key: String, code: String, modifiers: Modifiers },
    /// Character typed
    Char { text: String, modifiers: Modifiers },
    /// Mouse button pressed
    MouseDown { x: f32, y: f32, button: u16 },
    /// Mouse moved
    MouseMove { x: f32, y: f32 },
    /// Mouse button released
    MouseUp { x: f32, y: f32, button: u16 },
    /// Scroll wheel
    Wheel { dx: f32, dy: f32, modifiers: Modifiers },
}

/// A lifecycle or I/O event delivered by the host
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// Instance created with its embed-tag attributes
    DidCreate(HashMap<String, String>),
    DidDestroy,
    DidChangeView(View),
    DidChangeFocus(bool),
    HandleDocumentLoad(Resource),
    HandleInputEvent(InputEvent),
    Graphics3DContextLost,
    HandleMessage(serde_json::Value),
    MouseLockLost,
}

impl HostEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HostEvent::DidCreate(_) => "did_create",
            HostEvent::DidDestroy => "did_destroy",
            HostEvent::DidChangeView(_) => "did_change_view",
            HostEvent::DidChangeFocus(_) => "did_change_focus",
            HostEvent::HandleDocumentLoad(_) => "handle_document_load",
            HostEvent::HandleInputEvent(_) => "handle_input_event",
            HostEvent::Graphics3DContextLost => "graphics_3d_context_lost",
            HostEvent::HandleMessage(_) => "handle_message",
            HostEvent::MouseLockLost => "mouse_lock_lost",
        }
    }
}
