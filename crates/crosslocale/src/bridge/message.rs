//! Tagged-struct wire generation: `crosslocale_message` and friends.
//!
//! Layouts mirror `crosslocale.h` exactly. Two ownership domains exist:
//!
//! - Messages allocated here (for `recv`) are wrapped in [`OwnedMessage`].
//!   It owns the tree until [`OwnedMessage::decode`] consumes it, it is
//!   dropped, or [`OwnedMessage::into_raw`] hands it to the host, which must
//!   return it through `crosslocale_message_free`.
//! - Messages allocated by the host (for `send`) are only ever borrowed and
//!   copied out with [`read_message`]; the host keeps ownership.

use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr;

use crate::error::CodecError;
use crate::value::{MessageType, Value};

/// `crosslocale_message_str`: UTF-8 bytes, not NUL-terminated.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawStr {
    pub len: usize,
    pub ptr: *mut u8,
}

/// `crosslocale_message_list`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawList {
    pub len: usize,
    pub ptr: *mut RawMessage,
}

/// `crosslocale_message_dict`: `len` keys and `len` values, paired by index.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawDict {
    pub len: usize,
    pub keys: *mut RawStr,
    pub values: *mut RawMessage,
}

/// `crosslocale_message_inner`. The active field is selected by the tag.
#[repr(C)]
#[derive(Clone, Copy)]
pub union RawMessageInner {
    pub value_bool: bool,
    pub value_i64: i64,
    pub value_f64: f64,
    pub value_str: RawStr,
    pub value_list: RawList,
    pub value_dict: RawDict,
}

/// `crosslocale_message`.
///
/// The tag is kept as a plain integer: hosts may write any value there and
/// unknown tags read as [`MessageType::Invalid`].
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawMessage {
    pub tag: i32,
    pub value: RawMessageInner,
}

impl RawMessage {
    pub const NIL: Self = Self {
        tag: MessageType::Nil as i32,
        value: RawMessageInner {
            value_dict: RawDict {
                len: 0,
                keys: ptr::null_mut(),
                values: ptr::null_mut(),
            },
        },
    };

    pub fn message_type(&self) -> MessageType {
        MessageType::from_raw(self.tag)
    }
}

impl Default for RawMessage {
    fn default() -> Self {
        Self::NIL
    }
}

impl fmt::Debug for RawMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMessage")
            .field("type", &self.message_type())
            .finish_non_exhaustive()
    }
}

/// A Rust-allocated message tree with a single owner.
///
/// Exactly one release happens per tree: `decode` consumes it, `Drop` frees
/// it, and `into_raw` transfers the duty to whoever calls `from_raw` later.
pub struct OwnedMessage {
    raw: RawMessage,
}

// SAFETY: the tree is exclusively owned and contains no thread-bound data.
unsafe impl Send for OwnedMessage {}

impl OwnedMessage {
    /// Encode a value into a transferable tree.
    ///
    /// `Invalid` children are omitted; a top-level `Invalid` is an error.
    pub fn encode(value: Value) -> Result<Self, CodecError> {
        encode_raw(value)
            .map(|raw| Self { raw })
            .ok_or(CodecError::InvalidTopLevel)
    }

    /// Rebuild the value, consuming the tree.
    pub fn decode(self) -> Value {
        let raw = self.into_raw();
        // SAFETY: `raw` was produced by `encode_raw` and ownership was just
        // released by `into_raw`.
        unsafe { decode_owned(raw) }
    }

    /// Hand the tree over. The caller becomes responsible for passing it back
    /// to [`OwnedMessage::from_raw`] exactly once.
    pub fn into_raw(self) -> RawMessage {
        let this = ManuallyDrop::new(self);
        this.raw
    }

    /// Reclaim a tree previously released with [`OwnedMessage::into_raw`].
    ///
    /// # Safety
    ///
    /// `raw` must come from `into_raw` and must not have been reclaimed
    /// before. Messages allocated by the host must never be passed here.
    pub unsafe fn from_raw(raw: RawMessage) -> Self {
        Self { raw }
    }

    pub fn as_raw(&self) -> &RawMessage {
        &self.raw
    }

    pub fn message_type(&self) -> MessageType {
        self.raw.message_type()
    }
}

impl Drop for OwnedMessage {
    fn drop(&mut self) {
        // SAFETY: `self.raw` is owned by this wrapper and released only here.
        unsafe { free_raw(self.raw) }
    }
}

impl fmt::Debug for OwnedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OwnedMessage").field(&self.raw).finish()
    }
}

fn leak_slice<T>(items: Vec<T>) -> (usize, *mut T) {
    let boxed = items.into_boxed_slice();
    let len = boxed.len();
    (len, Box::into_raw(boxed).cast::<T>())
}

/// # Safety
///
/// `(ptr, len)` must come from `leak_slice` and not have been reclaimed.
unsafe fn reclaim_slice<T>(ptr: *mut T, len: usize) -> Vec<T> {
    unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(ptr, len)) }.into_vec()
}

fn encode_str(s: String) -> RawStr {
    let (len, ptr) = leak_slice(s.into_bytes());
    RawStr { len, ptr }
}

fn encode_raw(value: Value) -> Option<RawMessage> {
    let (tag, inner) = match value {
        Value::Invalid => return None,
        Value::Nil => return Some(RawMessage::NIL),
        Value::Bool(b) => (MessageType::Bool, RawMessageInner { value_bool: b }),
        Value::Int64(n) => (MessageType::I64, RawMessageInner { value_i64: n }),
        Value::Float64(n) => (MessageType::F64, RawMessageInner { value_f64: n }),
        Value::Str(s) => (
            MessageType::Str,
            RawMessageInner {
                value_str: encode_str(s),
            },
        ),
        Value::List(items) => {
            let (len, ptr) = leak_slice(items.into_iter().filter_map(encode_raw).collect());
            (
                MessageType::List,
                RawMessageInner {
                    value_list: RawList { len, ptr },
                },
            )
        }
        Value::Dict(entries) => {
            let (keys, values): (Vec<RawStr>, Vec<RawMessage>) = entries
                .into_iter()
                .filter_map(|(key, value)| encode_raw(value).map(|value| (encode_str(key), value)))
                .unzip();
            let (len, keys) = leak_slice(keys);
            let (_, values) = leak_slice(values);
            (
                MessageType::Dict,
                RawMessageInner {
                    value_dict: RawDict { len, keys, values },
                },
            )
        }
    };
    Some(RawMessage {
        tag: tag as i32,
        value: inner,
    })
}

/// # Safety
///
/// `raw` must be an unreleased tree produced by `encode_raw`.
unsafe fn decode_owned(raw: RawMessage) -> Value {
    unsafe {
        match raw.message_type() {
            MessageType::Nil => Value::Nil,
            MessageType::Bool => Value::Bool(raw.value.value_bool),
            MessageType::I64 => Value::Int64(raw.value.value_i64),
            MessageType::F64 => Value::Float64(raw.value.value_f64),
            MessageType::Str => {
                let RawStr { len, ptr } = raw.value.value_str;
                // Bytes came from a `String` in `encode_str`.
                Value::Str(String::from_utf8_unchecked(reclaim_slice(ptr, len)))
            }
            MessageType::List => {
                let RawList { len, ptr } = raw.value.value_list;
                Value::List(
                    reclaim_slice(ptr, len)
                        .into_iter()
                        .map(|item| decode_owned(item))
                        .collect(),
                )
            }
            MessageType::Dict => {
                let RawDict { len, keys, values } = raw.value.value_dict;
                let keys = reclaim_slice(keys, len);
                let values = reclaim_slice(values, len);
                Value::Dict(
                    keys.into_iter()
                        .zip(values)
                        .map(|(key, value)| {
                            let key = String::from_utf8_unchecked(reclaim_slice(key.ptr, key.len));
                            (key, decode_owned(value))
                        })
                        .collect(),
                )
            }
            MessageType::Invalid => Value::Invalid,
        }
    }
}

/// # Safety
///
/// `raw` must be an unreleased tree produced by `encode_raw`.
unsafe fn free_raw(raw: RawMessage) {
    unsafe {
        match raw.message_type() {
            MessageType::Str => {
                let RawStr { len, ptr } = raw.value.value_str;
                drop(reclaim_slice(ptr, len));
            }
            MessageType::List => {
                let RawList { len, ptr } = raw.value.value_list;
                for item in reclaim_slice(ptr, len) {
                    free_raw(item);
                }
            }
            MessageType::Dict => {
                let RawDict { len, keys, values } = raw.value.value_dict;
                for key in reclaim_slice(keys, len) {
                    drop(reclaim_slice(key.ptr, key.len));
                }
                for value in reclaim_slice(values, len) {
                    free_raw(value);
                }
            }
            _ => {}
        }
    }
}

/// Copy a host-owned message into a [`Value`] without taking ownership.
///
/// Every string and key is checked for UTF-8. Null pointers are accepted for
/// empty payloads. Children with an unknown or `INVALID` tag are omitted.
///
/// # Safety
///
/// Every pointer reachable from `raw` must be valid for reads of its stated
/// length for the duration of the call. Structure is trusted, not validated.
pub unsafe fn read_message(raw: &RawMessage) -> Result<Value, CodecError> {
    match unsafe { read_raw(raw) }? {
        Value::Invalid => Err(CodecError::InvalidTopLevel),
        value => Ok(value),
    }
}

unsafe fn host_slice<'a, T>(ptr: *const T, len: usize) -> &'a [T] {
    if ptr.is_null() || len == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }
}

unsafe fn read_str(raw: &RawStr) -> Result<String, CodecError> {
    let bytes = unsafe { host_slice(raw.ptr.cast_const(), raw.len) };
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| CodecError::NonUtf8String)
}

unsafe fn read_raw(raw: &RawMessage) -> Result<Value, CodecError> {
    let value = unsafe {
        match raw.message_type() {
            MessageType::Nil => Value::Nil,
            // Hosts may store any non-zero byte for `true`.
            MessageType::Bool => {
                let byte = ptr::addr_of!(raw.value).cast::<u8>().read();
                Value::Bool(byte != 0)
            }
            MessageType::I64 => Value::Int64(raw.value.value_i64),
            MessageType::F64 => Value::Float64(raw.value.value_f64),
            MessageType::Str => Value::Str(read_str(&raw.value.value_str)?),
            MessageType::List => {
                let list = raw.value.value_list;
                let items = host_slice(list.ptr.cast_const(), list.len);
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match read_raw(item)? {
                        Value::Invalid => {}
                        value => out.push(value),
                    }
                }
                Value::List(out)
            }
            MessageType::Dict => {
                let dict = raw.value.value_dict;
                let keys = host_slice(dict.keys.cast_const(), dict.len);
                let values = host_slice(dict.values.cast_const(), dict.len);
                let mut out = Vec::with_capacity(keys.len());
                for (key, value) in keys.iter().zip(values) {
                    match read_raw(value)? {
                        Value::Invalid => {}
                        value => out.push((read_str(key)?, value)),
                    }
                }
                Value::Dict(out)
            }
            MessageType::Invalid => Value::Invalid,
        }
    };
    Ok(value)
}
