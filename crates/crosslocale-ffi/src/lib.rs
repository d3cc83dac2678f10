//! C ABI for the crosslocale bridge. The matching declarations live in
//! `include/crosslocale.h`.
//!
//! Every entry point catches panics and reports them as
//! `CROSSLOCALE_ERR_GENERIC_RUST_PANIC`. A backend handle is an
//! `Arc<Backend>` leaked into a raw pointer: blocking calls hold their own
//! reference, so `crosslocale_backend_free` from another thread wakes them
//! instead of pulling the handle out from under them.

use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

use crosslocale_core::bridge::message::{OwnedMessage, RawMessage, read_message};
use crosslocale_core::{
    Backend, BackendError, CRATE_VERSION, ErrorCode, FFI_BRIDGE_VERSION, Loopback, NICE_VERSION,
    PROTOCOL_VERSION, logging,
};

/// Opaque `crosslocale_backend`; really an `Arc<Backend>`.
#[repr(C)]
pub struct BackendHandle {
    _opaque: [u8; 0],
}

/// Pointer that may live in a `static`; it only ever points at string literals.
#[repr(transparent)]
pub struct StaticPtr(*const u8);

// SAFETY: the pointee is immutable `'static` data.
unsafe impl Sync for StaticPtr {}

#[unsafe(no_mangle)]
pub static CROSSLOCALE_FFI_BRIDGE_VERSION: u32 = FFI_BRIDGE_VERSION;

#[unsafe(no_mangle)]
pub static CROSSLOCALE_VERSION_PTR: StaticPtr = StaticPtr(CRATE_VERSION.as_ptr());

#[unsafe(no_mangle)]
pub static CROSSLOCALE_VERSION_LEN: usize = CRATE_VERSION.len();

#[unsafe(no_mangle)]
pub static CROSSLOCALE_NICE_VERSION_PTR: StaticPtr = StaticPtr(NICE_VERSION.as_ptr());

#[unsafe(no_mangle)]
pub static CROSSLOCALE_NICE_VERSION_LEN: usize = NICE_VERSION.len();

#[unsafe(no_mangle)]
pub static CROSSLOCALE_PROTOCOL_VERSION: u32 = PROTOCOL_VERSION;

fn guard(body: impl FnOnce() -> ErrorCode) -> ErrorCode {
    panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|_| {
        tracing::error!("Panic caught at the C ABI boundary");
        ErrorCode::GenericPanic
    })
}

fn code_of(result: Result<(), BackendError>) -> ErrorCode {
    match result {
        Ok(()) => ErrorCode::Ok,
        Err(e) => e.code(),
    }
}

/// Take an extra reference to a live handle.
///
/// # Safety
///
/// `ptr` must come from `crosslocale_backend_new` and not have been freed.
unsafe fn retain(ptr: *const BackendHandle) -> Arc<Backend> {
    let ptr = ptr.cast::<Backend>();
    unsafe {
        Arc::increment_strong_count(ptr);
        Arc::from_raw(ptr)
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn crosslocale_init_logging() -> ErrorCode {
    guard(|| {
        logging::init_tracing();
        ErrorCode::Ok
    })
}

/// Static NUL-terminated description, or null for an unknown code.
#[unsafe(no_mangle)]
pub extern "C" fn crosslocale_error_description(code: i32) -> *const u8 {
    ErrorCode::from_raw(code).map_or(ptr::null(), |c| c.description_c().as_ptr().cast())
}

/// Static NUL-terminated symbolic name, or null for an unknown code.
#[unsafe(no_mangle)]
pub extern "C" fn crosslocale_error_id_str(code: i32) -> *const u8 {
    ErrorCode::from_raw(code).map_or(ptr::null(), |c| c.id_c().as_ptr().cast())
}

/// Release a message filled in by `crosslocale_backend_recv_message` and
/// reset it to NIL, so freeing it again is harmless.
///
/// # Safety
///
/// `message` must be null or point to a message produced by this library.
/// Messages built by the host must never be passed here.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn crosslocale_message_free(message: *mut RawMessage) -> ErrorCode {
    guard(|| {
        // SAFETY: caller guarantees `message` is null or valid for writes.
        let Some(slot) = (unsafe { message.as_mut() }) else {
            return ErrorCode::Ok;
        };
        let raw = std::mem::replace(slot, RawMessage::NIL);
        // SAFETY: the tree was produced by `OwnedMessage::into_raw`.
        drop(unsafe { OwnedMessage::from_raw(raw) });
        ErrorCode::Ok
    })
}

/// # Safety
///
/// `out` must be valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn crosslocale_backend_new(out: *mut *mut BackendHandle) -> ErrorCode {
    guard(|| match Backend::new(Loopback) {
        Ok(backend) => {
            let handle = Arc::into_raw(Arc::new(backend)).cast::<BackendHandle>().cast_mut();
            // SAFETY: caller guarantees `out` is valid for writes.
            unsafe { out.write(handle) };
            ErrorCode::Ok
        }
        Err(e) => e.code(),
    })
}

/// Shut the backend down and release the handle.
///
/// Returns `CROSSLOCALE_ERR_GENERIC_RUST_PANIC` if the worker panicked at
/// any point. Threads blocked in `recv` on this handle wake with
/// `CROSSLOCALE_ERR_BACKEND_DISCONNECTED`.
///
/// # Safety
///
/// `backend` must come from `crosslocale_backend_new` and is invalid after
/// this call. Freeing twice is undefined behaviour.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn crosslocale_backend_free(backend: *mut BackendHandle) -> ErrorCode {
    guard(|| {
        // SAFETY: caller transfers the handle's reference back to us.
        let backend = unsafe { Arc::from_raw(backend.cast_const().cast::<Backend>()) };
        code_of(backend.shutdown())
    })
}

/// Block until the worker produces a message and store it in `out`.
///
/// # Safety
///
/// `backend` must be a live handle; `out` must be valid for writes. The
/// previous contents of `out` are overwritten, not freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn crosslocale_backend_recv_message(
    backend: *const BackendHandle,
    out: *mut RawMessage,
) -> ErrorCode {
    guard(|| {
        // SAFETY: caller guarantees `backend` is live.
        let backend = unsafe { retain(backend) };
        let message = match backend.recv() {
            Ok(value) => OwnedMessage::encode(value).map_err(BackendError::from),
            Err(e) => Err(e),
        };
        match message {
            Ok(message) => {
                // SAFETY: caller guarantees `out` is valid for writes.
                unsafe { out.write(message.into_raw()) };
                ErrorCode::Ok
            }
            Err(e) => e.code(),
        }
    })
}

/// Copy `message` and queue it for the worker. The host keeps ownership of
/// `message`.
///
/// # Safety
///
/// `backend` must be a live handle; `message` must point to a well-formed
/// message tree that stays valid for the duration of the call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn crosslocale_backend_send_message(
    backend: *const BackendHandle,
    message: *const RawMessage,
) -> ErrorCode {
    guard(|| {
        // SAFETY: caller guarantees `backend` is live.
        let backend = unsafe { retain(backend) };
        // SAFETY: caller guarantees the tree is valid for reads.
        let value = match unsafe { read_message(&*message) } {
            Ok(value) => value,
            Err(e) => return BackendError::from(e).code(),
        };
        code_of(backend.send(value))
    })
}

/// # Safety
///
/// `backend` must be a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn crosslocale_backend_close(backend: *mut BackendHandle) -> ErrorCode {
    guard(|| {
        // SAFETY: caller guarantees `backend` is live.
        unsafe { &*backend.cast::<Backend>() }.close();
        ErrorCode::Ok
    })
}

/// # Safety
///
/// `backend` must be a live handle; `out` must be valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn crosslocale_backend_is_closed(
    backend: *mut BackendHandle,
    out: *mut bool,
) -> ErrorCode {
    guard(|| {
        // SAFETY: caller guarantees both pointers are valid.
        unsafe { out.write((*backend.cast::<Backend>()).is_closed()) };
        ErrorCode::Ok
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crosslocale_core::Value;
    use crosslocale_core::bridge::message::{RawMessageInner, RawStr};
    use crosslocale_core::value::MessageType;
    use std::ffi::CStr;
    use std::thread;
    use std::time::Duration;

    fn new_backend() -> *mut BackendHandle {
        let mut handle = ptr::null_mut();
        assert_eq!(unsafe { crosslocale_backend_new(&mut handle) }, ErrorCode::Ok);
        assert!(!handle.is_null());
        handle
    }

    fn send(handle: *mut BackendHandle, value: Value) -> ErrorCode {
        let message = OwnedMessage::encode(value).unwrap();
        unsafe { crosslocale_backend_send_message(handle, message.as_raw()) }
    }

    fn c_str(ptr: *const u8) -> &'static str {
        unsafe { CStr::from_ptr(ptr.cast()) }.to_str().unwrap()
    }

    #[test]
    fn version_statics() {
        let version = unsafe {
            std::slice::from_raw_parts(CROSSLOCALE_VERSION_PTR.0, CROSSLOCALE_VERSION_LEN)
        };
        assert_eq!(version, CRATE_VERSION.as_bytes());
        let nice = unsafe {
            std::slice::from_raw_parts(CROSSLOCALE_NICE_VERSION_PTR.0, CROSSLOCALE_NICE_VERSION_LEN)
        };
        assert!(nice.starts_with(version));
        assert_eq!(CROSSLOCALE_FFI_BRIDGE_VERSION, FFI_BRIDGE_VERSION);
        assert_eq!(CROSSLOCALE_PROTOCOL_VERSION, PROTOCOL_VERSION);
    }

    #[test]
    fn error_strings() {
        let table: Vec<String> = (0..=5)
            .map(|code| {
                format!(
                    "{code} {}: {}",
                    c_str(crosslocale_error_id_str(code)),
                    c_str(crosslocale_error_description(code))
                )
            })
            .collect();
        insta::assert_snapshot!(table.join("\n"), @r"
        0 CROSSLOCALE_OK: OK
        1 CROSSLOCALE_ERR_GENERIC_RUST_PANIC: a generic Rust panic has occurred
        2 CROSSLOCALE_ERR_BACKEND_DISCONNECTED: the backend thread has disconnected
        3 CROSSLOCALE_ERR_NON_UTF8_STRING: a provided string was not valid UTF-8
        4 CROSSLOCALE_ERR_SPAWN_THREAD_FAILED: failed to spawn a thread
        5 CROSSLOCALE_ERR_INVALID_MESSAGE: the message contains no representable value
        ");
        assert!(crosslocale_error_id_str(42).is_null());
        assert!(crosslocale_error_description(-3).is_null());
    }

    #[test]
    fn init_logging_is_repeatable() {
        assert_eq!(crosslocale_init_logging(), ErrorCode::Ok);
        assert_eq!(crosslocale_init_logging(), ErrorCode::Ok);
    }

    #[test]
    fn send_recv_and_free_message() {
        let handle = new_backend();
        let value = Value::dict([
            ("a", Value::Int64(1)),
            (
                "b",
                Value::List(vec![Value::Bool(true), Value::Nil, Value::Float64(3.14)]),
            ),
        ]);
        assert_eq!(send(handle, value.clone()), ErrorCode::Ok);

        let mut message = RawMessage::NIL;
        assert_eq!(
            unsafe { crosslocale_backend_recv_message(handle, &mut message) },
            ErrorCode::Ok
        );
        assert_eq!(message.message_type(), MessageType::Dict);
        assert_eq!(unsafe { read_message(&message) }.unwrap(), value);

        assert_eq!(unsafe { crosslocale_message_free(&mut message) }, ErrorCode::Ok);
        assert_eq!(message.message_type(), MessageType::Nil);
        // Already reset; a second free is a no-op.
        assert_eq!(unsafe { crosslocale_message_free(&mut message) }, ErrorCode::Ok);

        assert_eq!(unsafe { crosslocale_backend_free(handle) }, ErrorCode::Ok);
    }

    #[test]
    fn close_then_send_fails() {
        let handle = new_backend();
        let mut closed = false;
        assert_eq!(unsafe { crosslocale_backend_is_closed(handle, &mut closed) }, ErrorCode::Ok);
        assert!(!closed);

        assert_eq!(unsafe { crosslocale_backend_close(handle) }, ErrorCode::Ok);
        assert_eq!(unsafe { crosslocale_backend_close(handle) }, ErrorCode::Ok);
        assert_eq!(unsafe { crosslocale_backend_is_closed(handle, &mut closed) }, ErrorCode::Ok);
        assert!(closed);

        assert_eq!(send(handle, Value::Nil), ErrorCode::BackendDisconnected);
        let mut message = RawMessage::NIL;
        assert_eq!(
            unsafe { crosslocale_backend_recv_message(handle, &mut message) },
            ErrorCode::BackendDisconnected
        );
        assert_eq!(unsafe { crosslocale_backend_free(handle) }, ErrorCode::Ok);
    }

    #[test]
    fn non_utf8_string_is_rejected() {
        let handle = new_backend();
        let mut bytes = *b"\xffbad";
        let message = RawMessage {
            tag: MessageType::Str as i32,
            value: RawMessageInner {
                value_str: RawStr {
                    len: bytes.len(),
                    ptr: bytes.as_mut_ptr(),
                },
            },
        };
        assert_eq!(
            unsafe { crosslocale_backend_send_message(handle, &message) },
            ErrorCode::NonUtf8String
        );

        // The handle is still usable.
        assert_eq!(send(handle, Value::Str("ok".into())), ErrorCode::Ok);
        let mut reply = RawMessage::NIL;
        assert_eq!(
            unsafe { crosslocale_backend_recv_message(handle, &mut reply) },
            ErrorCode::Ok
        );
        assert_eq!(unsafe { read_message(&reply) }.unwrap(), Value::Str("ok".into()));
        unsafe { crosslocale_message_free(&mut reply) };
        assert_eq!(unsafe { crosslocale_backend_free(handle) }, ErrorCode::Ok);
    }

    #[test]
    fn invalid_top_level_is_rejected() {
        let handle = new_backend();
        let message = RawMessage {
            tag: MessageType::Invalid as i32,
            ..RawMessage::NIL
        };
        assert_eq!(
            unsafe { crosslocale_backend_send_message(handle, &message) },
            ErrorCode::InvalidMessage
        );
        assert_eq!(unsafe { crosslocale_backend_free(handle) }, ErrorCode::Ok);
    }

    #[test]
    fn free_wakes_blocked_recv() {
        let handle = new_backend();
        let address = handle as usize;
        let reader = thread::spawn(move || {
            let mut message = RawMessage::NIL;
            unsafe { crosslocale_backend_recv_message(address as *const BackendHandle, &mut message) }
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(unsafe { crosslocale_backend_free(handle) }, ErrorCode::Ok);
        assert_eq!(reader.join().unwrap(), ErrorCode::BackendDisconnected);
    }

    #[test]
    fn guard_turns_panics_into_codes() {
        assert_eq!(guard(|| panic!("glue bug")), ErrorCode::GenericPanic);
        assert_eq!(guard(|| ErrorCode::BackendDisconnected), ErrorCode::BackendDisconnected);
    }
}
