//! C FFI surface for sonata.
//!
//! Pattern: opaque EngineHandle + C strings + JSON serialization.
//!
//! A mobile host (Kotlin/Swift via JNI or C, Flutter via `dart:ffi`) owns the
//! platform pieces: it forwards focus changes and the becoming-noisy
//! broadcast, mirrors `sonata_wake_lock_held` onto its wake lock, and drains
//! events with `sonata_poll_event`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::{json, Value};

use sonata_core::effects::library::{parse_tracks, LibraryProvider};
use sonata_core::effects::{
    FocusGrant, NoisyRegistration, NoopRenderer, PolicyFocus, Renderer, TimedWakeLock, WakeLock,
};
use sonata_core::{
    Catalog, ChildrenResult, Engine, EngineConfig, FocusChange, PlayerEvent, SessionParts,
    TransportCommand,
};

/// Bumped whenever the C surface changes.
const FFI_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Error handling (thread-local last error)
// ---------------------------------------------------------------------------

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn set_error(msg: String) {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = Some(msg));
}

fn clear_error() {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = None);
}

/// Returns the last error message (caller frees with `sonata_string_free`).
#[no_mangle]
pub extern "C" fn sonata_last_error() -> *mut c_char {
    LAST_ERROR.with(|cell| {
        cell.borrow_mut()
            .take()
            .and_then(|s| CString::new(s).ok())
            .map(|s| s.into_raw())
            .unwrap_or(ptr::null_mut())
    })
}

/// Frees a string returned from sonata FFI.
///
/// # Safety
/// Must be a pointer returned from this FFI and not already freed.
#[no_mangle]
pub unsafe extern "C" fn sonata_string_free(ptr: *mut c_char) {
    if !ptr.is_null() {
        let _ = CString::from_raw(ptr);
    }
}

static LOGGING: OnceCell<()> = OnceCell::new();

/// Install `env_logger` once per process. Hosts may have their own logger.
fn init_logging() {
    LOGGING.get_or_init(|| {
        let env = env_logger::Env::default().default_filter_or("warn");
        if env_logger::Builder::from_env(env).try_init().is_err() {
            log::debug!("sonata: logger already installed");
        }
    });
}

// ---------------------------------------------------------------------------
// Opaque handle
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct EngineHandle {
    _private: [u8; 0],
}

struct EngineHandleInner {
    engine: Engine,
    library: Arc<LibraryProvider>,
    focus: Arc<PolicyFocus>,
    wake: Arc<TimedWakeLock>,
    noisy: Arc<NoisyRegistration>,
    events: Mutex<Receiver<PlayerEvent>>,
    /// Browse results that arrived after the ready gate opened.
    browse: Arc<Mutex<VecDeque<Value>>>,
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Opens an engine on the native renderer. `config_json` may be NULL.
///
/// # Safety
/// `config_json` must be NULL or a valid null-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn sonata_open(config_json: *const c_char) -> *mut EngineHandle {
    open_with(config_json, native_renderer())
}

/// Opens an engine whose renderer is instantly ready and silent.
///
/// # Safety
/// `config_json` must be NULL or a valid null-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn sonata_open_headless(config_json: *const c_char) -> *mut EngineHandle {
    open_with(config_json, Arc::new(NoopRenderer::new()))
}

#[cfg(feature = "native")]
fn native_renderer() -> Arc<dyn Renderer> {
    Arc::new(sonata_core::effects::audio::AudioRenderer::new())
}

#[cfg(not(feature = "native"))]
fn native_renderer() -> Arc<dyn Renderer> {
    Arc::new(NoopRenderer::new())
}

fn open_with(config_json: *const c_char, renderer: Arc<dyn Renderer>) -> *mut EngineHandle {
    init_logging();
    clear_error();
    let config = if config_json.is_null() {
        EngineConfig::default()
    } else {
        match read_cstr(config_json) {
            Ok(text) => EngineConfig::from_json_or_default(&text),
            Err(e) => {
                set_error(e);
                return ptr::null_mut();
            }
        }
    };

    let library = Arc::new(LibraryProvider::new(Vec::new()));
    let focus = Arc::new(PolicyFocus::granting());
    let wake = Arc::new(TimedWakeLock::new());
    let noisy = Arc::new(NoisyRegistration::new());
    let parts = SessionParts {
        renderer,
        focus: focus.clone(),
        wake: wake.clone(),
        noisy: noisy.clone(),
    };
    let catalog = Arc::new(Catalog::new(library.clone(), config.min_song_duration_ms));
    let engine = Engine::new(catalog, parts, config);
    let events = Mutex::new(engine.subscribe());
    engine.start();

    let inner = EngineHandleInner {
        engine,
        library,
        focus,
        wake,
        noisy,
        events,
        browse: Arc::new(Mutex::new(VecDeque::new())),
    };
    Box::into_raw(Box::new(inner)) as *mut EngineHandle
}

/// Closes the engine and releases all resources.
#[no_mangle]
pub extern "C" fn sonata_close(handle: *mut EngineHandle) {
    if !handle.is_null() {
        unsafe {
            let inner = Box::from_raw(handle as *mut EngineHandleInner);
            inner.engine.shutdown();
        }
    }
}

// ---------------------------------------------------------------------------
// Library + catalog
// ---------------------------------------------------------------------------

/// Replace the track list with a JSON array of track records. Call
/// `sonata_access_granted` afterwards to (re)build the catalog.
/// Returns the track count, or -1 on error.
#[no_mangle]
pub extern "C" fn sonata_set_tracks(handle: *mut EngineHandle, json: *const c_char) -> i32 {
    clear_error();
    let inner = match inner_ref(handle) {
        Ok(i) => i,
        Err(e) => return err_code(e, -1),
    };
    let text = match read_cstr(json) {
        Ok(s) => s,
        Err(e) => return err_code(e, -1),
    };
    match parse_tracks(&text) {
        Ok(tracks) => {
            let count = tracks.len() as i32;
            inner.library.set_tracks(tracks);
            count
        }
        Err(e) => err_code(e.to_string(), -1),
    }
}

/// Media access was granted: load the catalog in the background.
#[no_mangle]
pub extern "C" fn sonata_access_granted(handle: *mut EngineHandle) -> i32 {
    clear_error();
    match inner_ref(handle) {
        Ok(inner) => {
            // The load thread runs detached; readiness shows up through
            // parked browse requests.
            let _ = inner.engine.access_granted();
            1
        }
        Err(e) => err_code(e, 0),
    }
}

/// Browse root id (caller frees).
#[no_mangle]
pub extern "C" fn sonata_root_id(handle: *mut EngineHandle) -> *mut c_char {
    clear_error();
    match inner_ref(handle) {
        Ok(inner) => to_cstr(inner.engine.root_id().to_string()),
        Err(e) => err_null(e),
    }
}

/// Children of `parent` as a JSON array when the catalog is ready, otherwise
/// `{"pending":true}` and the result arrives later as a `children` event from
/// `sonata_poll_event`. NULL on error (unknown id, failed load).
#[no_mangle]
pub extern "C" fn sonata_load_children(handle: *mut EngineHandle, parent: *const c_char) -> *mut c_char {
    clear_error();
    let inner = match inner_ref(handle) {
        Ok(i) => i,
        Err(e) => return err_null(e),
    };
    let parent = match read_cstr(parent) {
        Ok(s) => s,
        Err(e) => return err_null(e),
    };

    let slot: Arc<Mutex<Delivery>> = Arc::new(Mutex::new(Delivery::default()));
    let delivered = {
        let slot = Arc::clone(&slot);
        let browse = Arc::clone(&inner.browse);
        let key = parent.clone();
        inner.engine.load_children(&parent, move |result| {
            let mut slot = slot.lock();
            if slot.parked {
                browse.lock().push_back(children_event(&key, &result));
            } else {
                slot.result = Some(result);
            }
        })
    };

    let mut slot = slot.lock();
    if delivered {
        return match slot.result.take() {
            Some(Ok(children)) => json_to_cstr(&children),
            Some(Err(e)) => err_null(e.to_string()),
            None => err_null("browse result missing".into()),
        };
    }
    slot.parked = true;
    // Settled between the gate check and here.
    if let Some(result) = slot.result.take() {
        inner.browse.lock().push_back(children_event(&parent, &result));
    }
    to_cstr(json!({ "pending": true }).to_string())
}

#[derive(Default)]
struct Delivery {
    parked: bool,
    result: Option<ChildrenResult>,
}

fn children_event(parent: &str, result: &ChildrenResult) -> Value {
    let data = match result {
        Ok(children) => json!({ "parent": parent, "children": children }),
        Err(e) => json!({ "parent": parent, "error": e.to_string() }),
    };
    json!({ "type": "children", "data": data })
}

// ---------------------------------------------------------------------------
// Transport + events
// ---------------------------------------------------------------------------

/// Post a transport command (`{"action":"play_from_id","id":"..."}`).
/// Returns 1 on success, 0 on error.
#[no_mangle]
pub extern "C" fn sonata_command(handle: *mut EngineHandle, json: *const c_char) -> i32 {
    clear_error();
    let inner = match inner_ref(handle) {
        Ok(i) => i,
        Err(e) => return err_code(e, 0),
    };
    let text = match read_cstr(json) {
        Ok(s) => s,
        Err(e) => return err_code(e, 0),
    };
    let value: Value = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(e) => return err_code(e.to_string(), 0),
    };
    let Some(command) = TransportCommand::from_value(&value) else {
        return err_code(format!("unknown command: {}", text), 0);
    };
    match inner.engine.command(command) {
        Ok(()) => 1,
        Err(e) => err_code(e.to_string(), 0),
    }
}

/// Current playback snapshot as JSON (caller frees).
#[no_mangle]
pub extern "C" fn sonata_playback_state(handle: *mut EngineHandle) -> *mut c_char {
    clear_error();
    match inner_ref(handle) {
        Ok(inner) => json_to_cstr(&inner.engine.playback_state()),
        Err(e) => err_null(e),
    }
}

/// Next pending event as JSON (caller frees), or NULL when there is none.
/// Browse results come before player events.
#[no_mangle]
pub extern "C" fn sonata_poll_event(handle: *mut EngineHandle) -> *mut c_char {
    clear_error();
    let inner = match inner_ref(handle) {
        Ok(i) => i,
        Err(e) => return err_null(e),
    };
    if let Some(event) = inner.browse.lock().pop_front() {
        return to_cstr(event.to_string());
    }
    let next = inner.events.lock().try_recv();
    match next {
        Ok(event) => json_to_cstr(&event),
        Err(_) => ptr::null_mut(),
    }
}

// ---------------------------------------------------------------------------
// Platform signals
// ---------------------------------------------------------------------------

/// Forward a focus change (1 gain, -1 loss, -2 transient, -3 can duck).
#[no_mangle]
pub extern "C" fn sonata_focus_changed(handle: *mut EngineHandle, code: i32) -> i32 {
    clear_error();
    let inner = match inner_ref(handle) {
        Ok(i) => i,
        Err(e) => return err_code(e, 0),
    };
    let Some(change) = FocusChange::from_code(code) else {
        return err_code(format!("unknown focus change: {}", code), 0);
    };
    match inner.engine.focus_changed(change) {
        Ok(()) => 1,
        Err(e) => err_code(e.to_string(), 0),
    }
}

/// Answer future focus requests with `code` (1 granted, 2 delayed, 0 failed).
#[no_mangle]
pub extern "C" fn sonata_set_focus_policy(handle: *mut EngineHandle, code: i32) -> i32 {
    clear_error();
    let inner = match inner_ref(handle) {
        Ok(i) => i,
        Err(e) => return err_code(e, 0),
    };
    let grant = match code {
        1 => FocusGrant::Granted,
        2 => FocusGrant::Delayed,
        0 => FocusGrant::Denied,
        other => return err_code(format!("unknown focus policy: {}", other), 0),
    };
    inner.focus.set_policy(grant);
    1
}

/// Headphones were unplugged.
#[no_mangle]
pub extern "C" fn sonata_becoming_noisy(handle: *mut EngineHandle) -> i32 {
    clear_error();
    match inner_ref(handle).and_then(|inner| inner.engine.becoming_noisy().map_err(|e| e.to_string())) {
        Ok(()) => 1,
        Err(e) => err_code(e, 0),
    }
}

/// 1 while the host should hold its wake lock.
#[no_mangle]
pub extern "C" fn sonata_wake_lock_held(handle: *mut EngineHandle) -> i32 {
    clear_error();
    match inner_ref(handle) {
        Ok(inner) => inner.wake.is_held() as i32,
        Err(e) => err_code(e, 0),
    }
}

/// 1 while the host should forward the becoming-noisy broadcast.
#[no_mangle]
pub extern "C" fn sonata_noisy_registered(handle: *mut EngineHandle) -> i32 {
    clear_error();
    match inner_ref(handle) {
        Ok(inner) => inner.noisy.is_registered() as i32,
        Err(e) => err_code(e, 0),
    }
}

/// Version of the C surface.
#[no_mangle]
pub extern "C" fn sonata_version() -> u32 {
    FFI_VERSION
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn inner_ref<'a>(handle: *mut EngineHandle) -> Result<&'a EngineHandleInner, String> {
    if handle.is_null() {
        return Err("null engine handle".into());
    }
    Ok(unsafe { &*(handle as *mut EngineHandleInner) })
}

fn read_cstr(ptr: *const c_char) -> Result<String, String> {
    if ptr.is_null() {
        return Err("null string pointer".into());
    }
    unsafe {
        CStr::from_ptr(ptr)
            .to_str()
            .map(String::from)
            .map_err(|_| "invalid utf-8".into())
    }
}

fn json_to_cstr<T: serde::Serialize>(value: &T) -> *mut c_char {
    match serde_json::to_string(value) {
        Ok(json) => to_cstr(json),
        Err(e) => err_null(e.to_string()),
    }
}

fn to_cstr(s: String) -> *mut c_char {
    CString::new(s)
        .map(|c| c.into_raw())
        .unwrap_or(ptr::null_mut())
}

fn err_null(msg: String) -> *mut c_char {
    set_error(msg);
    ptr::null_mut()
}

fn err_code(msg: String, code: i32) -> i32 {
    set_error(msg);
    code
}

// ---------------------------------------------------------------------------
// FFI Integration Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    const TRACKS: &str = r#"[
        {"id":"s1","title":"Alpha","artist":"Band","album":"Record","genre":"Rock",
         "duration_ms":180000,"path":"/music/alpha.mp3","date_added":1},
        {"id":"s2","title":"Beta","artist":"Band","album":"Record",
         "duration_ms":200000,"path":"/music/beta.mp3","date_added":2},
        {"id":"jingle","title":"Jingle","duration_ms":2000,"path":"/music/jingle.mp3"}
    ]"#;

    fn c(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    /// Read a *mut c_char into a String and free it.
    fn read_ffi_string(ptr: *mut c_char) -> String {
        assert!(!ptr.is_null(), "FFI returned null string");
        let s = unsafe { CStr::from_ptr(ptr).to_str().unwrap().to_string() };
        unsafe { sonata_string_free(ptr) };
        s
    }

    fn last_error() -> String {
        read_ffi_string(sonata_last_error())
    }

    fn headless() -> *mut EngineHandle {
        let handle = unsafe { sonata_open_headless(ptr::null()) };
        assert!(!handle.is_null(), "sonata_open_headless returned null");
        let tracks = c(TRACKS);
        assert_eq!(sonata_set_tracks(handle, tracks.as_ptr()), 3);
        handle
    }

    /// Poll until an event satisfies `pred`.
    fn poll_until(handle: *mut EngineHandle, pred: impl Fn(&Value) -> bool) -> Value {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let ptr = sonata_poll_event(handle);
            if ptr.is_null() {
                std::thread::sleep(Duration::from_millis(5));
                continue;
            }
            let event: Value = serde_json::from_str(&read_ffi_string(ptr)).unwrap();
            if pred(&event) {
                return event;
            }
        }
        panic!("no matching event in time");
    }

    fn is_state(event: &Value, state: &str) -> bool {
        event["type"] == "playback_state_changed" && event["data"]["state"] == state
    }

    fn ready(handle: *mut EngineHandle) {
        let root = c("/");
        let pending = read_ffi_string(sonata_load_children(handle, root.as_ptr()));
        assert_eq!(pending, r#"{"pending":true}"#);
        assert_eq!(sonata_access_granted(handle), 1);
        poll_until(handle, |e| e["type"] == "children");
    }

    #[test]
    fn ffi_version() {
        assert_eq!(sonata_version(), FFI_VERSION);
    }

    #[test]
    fn ffi_null_handle_returns_error() {
        assert!(sonata_playback_state(ptr::null_mut()).is_null());
        assert!(last_error().contains("null"));
        assert_eq!(sonata_becoming_noisy(ptr::null_mut()), 0);
        assert!(last_error().contains("null"));
    }

    #[test]
    fn ffi_open_close_lifecycle() {
        let handle = headless();
        let state: Value = serde_json::from_str(&read_ffi_string(sonata_playback_state(handle))).unwrap();
        assert_eq!(state["state"], "none");
        assert_eq!(read_ffi_string(sonata_root_id(handle)), "/");
        sonata_close(handle);
    }

    #[test]
    fn ffi_browse_pending_then_immediate() {
        let handle = headless();
        let root = c("/");
        assert_eq!(read_ffi_string(sonata_load_children(handle, root.as_ptr())), r#"{"pending":true}"#);
        sonata_access_granted(handle);

        let event = poll_until(handle, |e| e["type"] == "children");
        assert_eq!(event["data"]["parent"], "/");
        assert_eq!(event["data"]["children"].as_array().unwrap().len(), 4);

        let songs = c("/songs");
        let list: Vec<Value> =
            serde_json::from_str(&read_ffi_string(sonata_load_children(handle, songs.as_ptr()))).unwrap();
        let titles: Vec<&str> = list.iter().map(|n| n["title"].as_str().unwrap()).collect();
        assert_eq!(titles, vec!["Alpha", "Beta"]);

        let bogus = c("/nowhere");
        assert!(sonata_load_children(handle, bogus.as_ptr()).is_null());
        assert!(last_error().contains("Unknown Browse Id"));
        sonata_close(handle);
    }

    #[test]
    fn ffi_play_from_id_flow() {
        let handle = headless();
        ready(handle);

        let cmd = c(r#"{"action":"play_from_id","id":"s2"}"#);
        assert_eq!(sonata_command(handle, cmd.as_ptr()), 1);
        let meta = poll_until(handle, |e| e["type"] == "metadata_changed");
        assert_eq!(meta["data"]["title"], "Beta");
        poll_until(handle, |e| is_state(e, "playing"));
        assert_eq!(sonata_wake_lock_held(handle), 1);
        assert_eq!(sonata_noisy_registered(handle), 1);

        assert_eq!(sonata_becoming_noisy(handle), 1);
        let pause = c(r#"{"action":"pause"}"#);
        assert_eq!(sonata_command(handle, pause.as_ptr()), 1);
        poll_until(handle, |e| is_state(e, "paused"));
        assert_eq!(sonata_wake_lock_held(handle), 0);
        assert_eq!(sonata_noisy_registered(handle), 0);
        sonata_close(handle);
    }

    #[test]
    fn ffi_focus_policy_and_changes() {
        let handle = headless();
        ready(handle);
        assert_eq!(sonata_set_focus_policy(handle, 2), 1);

        let cmd = c(r#"{"action":"play_from_id","id":"s1"}"#);
        sonata_command(handle, cmd.as_ptr());
        poll_until(handle, |e| is_state(e, "paused"));

        assert_eq!(sonata_focus_changed(handle, 1), 1);
        poll_until(handle, |e| is_state(e, "playing"));

        assert_eq!(sonata_focus_changed(handle, 7), 0);
        assert!(last_error().contains("unknown focus change"));
        assert_eq!(sonata_set_focus_policy(handle, 9), 0);
        sonata_close(handle);
    }

    #[test]
    fn ffi_rejects_bad_commands() {
        let handle = headless();
        let skip = c(r#"{"action":"skip_to_next"}"#);
        assert_eq!(sonata_command(handle, skip.as_ptr()), 0);
        assert!(last_error().contains("not supported"));

        let unknown = c(r#"{"action":"rewind"}"#);
        assert_eq!(sonata_command(handle, unknown.as_ptr()), 0);
        assert!(last_error().contains("unknown command"));

        let garbage = c("not json");
        assert_eq!(sonata_command(handle, garbage.as_ptr()), 0);
        assert_eq!(sonata_set_tracks(handle, garbage.as_ptr()), -1);
        sonata_close(handle);
    }

    #[test]
    fn ffi_commands_after_shutdown_are_refused() {
        let handle = headless();
        let inner = inner_ref(handle).unwrap();
        inner.engine.shutdown();
        let play = c(r#"{"action":"play"}"#);
        assert_eq!(sonata_command(handle, play.as_ptr()), 0);
        assert!(last_error().contains("shut down"));
        sonata_close(handle);
    }
}
