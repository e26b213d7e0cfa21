//! Browser runtime integration
//!
//! The embedding page forwards each plugin callback to one of the exported
//! functions below. Payloads cross the boundary as JSON strings and are
//! decoded here, so the kernel only ever sees `HostEvent` values.
//!
//! The application supplies its handlers with `init`. If that happens
//! before the host creates the instance, the factory is parked until
//! `didCreate` and registered from a spawned task once the callback has
//! returned; events arriving in between are queued by the kernel.

use crate::boot;
use crate::console_log;
use crate::kernel::{Bridge, HostEvent, InputEvent, Instance, InstanceHandlers, Resource, View};
use serde::de::DeserializeOwned;
use std::cell::RefCell;
use std::collections::HashMap;
use wasm_bindgen::prelude::*;

type Factory = Box<dyn FnOnce(Instance) -> Box<dyn InstanceHandlers>>;

thread_local! {
    static FACTORY: RefCell<Option<Factory>> = const { RefCell::new(None) };
}

/// Application entry point
pub fn init<F>(factory: F)
where
    F: FnOnce(Instance) -> Box<dyn InstanceHandlers> + 'static,
{
    match boot::bridge() {
        Some(bridge) => register(&bridge, Box::new(factory)),
        None => FACTORY.with(|f| *f.borrow_mut() = Some(Box::new(factory))),
    }
}

fn register(bridge: &Bridge, factory: Factory) {
    if let Err(e) = bridge.init(factory) {
        console_log!("[runtime] init failed: {}", e);
    }
}

fn parse<T: DeserializeOwned>(what: &str, json: &str) -> Option<T> {
    match serde_json::from_str(json) {
        Ok(value) => Some(value),
        Err(e) => {
            console_log!("[runtime] bad {} payload: {}", what, e);
            None
        }
    }
}

fn deliver(event: HostEvent) -> bool {
    let Some(bridge) = boot::bridge() else {
        console_log!("[runtime] {} before instance creation, dropped", event.name());
        return false;
    };
    match bridge.deliver(event) {
        Ok(handled) => handled,
        Err(e) => {
            console_log!("[runtime] {}", e);
            false
        }
    }
}

#[wasm_bindgen(js_name = didCreate)]
pub fn did_create(args: &str) -> bool {
    let args: HashMap<String, String> = parse("creation", args).unwrap_or_default();
    if boot::bridge().is_some() {
        return deliver(HostEvent::DidCreate(args));
    }

    let bridge = boot::start(&args);
    let handled = deliver(HostEvent::DidCreate(args));
    if let Some(factory) = FACTORY.with(|f| f.borrow_mut().take()) {
        wasm_bindgen_futures::spawn_local(async move {
            register(&bridge, factory);
        });
    }
    handled
}

#[wasm_bindgen(js_name = didDestroy)]
pub fn did_destroy() {
    deliver(HostEvent::DidDestroy);
}

#[wasm_bindgen(js_name = didChangeView)]
pub fn did_change_view(view: &str) {
    if let Some(view) = parse::<View>("view", view) {
        deliver(HostEvent::DidChangeView(view));
    }
}

#[wasm_bindgen(js_name = didChangeFocus)]
pub fn did_change_focus(has_focus: bool) {
    deliver(HostEvent::DidChangeFocus(has_focus));
}

#[wasm_bindgen(js_name = handleDocumentLoad)]
pub fn handle_document_load(loader: i32) -> bool {
    deliver(HostEvent::HandleDocumentLoad(Resource(loader)))
}

#[wasm_bindgen(js_name = handleInputEvent)]
pub fn handle_input_event(event: &str) -> bool {
    match parse::<InputEvent>("input", event) {
        Some(event) => deliver(HostEvent::HandleInputEvent(event)),
        None => false,
    }
}

#[wasm_bindgen(js_name = graphics3DContextLost)]
pub fn graphics_3d_context_lost() {
    deliver(HostEvent::Graphics3DContextLost);
}

/// Non-JSON messages are passed through as strings
#[wasm_bindgen(js_name = handleMessage)]
pub fn handle_message(message: &str) {
    let value = serde_json::from_str(message)
        .unwrap_or_else(|_| serde_json::Value::String(message.to_string()));
    deliver(HostEvent::HandleMessage(value));
}

#[wasm_bindgen(js_name = mouseLockLost)]
pub fn mouse_lock_lost() {
    deliver(HostEvent::MouseLockLost);
}
