//! Restricted unpickler for PyTorch checkpoints.
//!
//! Only the classes needed to rebuild a state dict are resolved: ordered
//! dicts, tensor rebuild helpers and typed storages. Every other class
//! reference becomes [`Object::Placeholder`], and calling or building a
//! placeholder yields another placeholder, so training callbacks, optimizer
//! objects or numpy scalars inside a checkpoint never abort the load.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::io::{self, BufRead};
use std::rc::Rc;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use safetensors::Dtype;
use tracing::warn;

/// Errors raised while decoding a pickle stream.
#[derive(Debug, thiserror::Error)]
pub enum PickleError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid pickle opcode: 0x{0:02x}")]
    InvalidOpCode(u8),

    #[error("Unsupported pickle protocol version: {0}")]
    InvalidProtocol(u8),

    #[error("Unexpected opcode {0:?} in current context")]
    UnexpectedOpCode(OpCode),

    #[error("Pickle stack underflow - the file may be corrupted")]
    StackUnderflow,

    #[error("Pickle memo reference {0} not found")]
    MemoNotFound(u32),

    #[error("Invalid data in pickle: {0}")]
    InvalidData(String),
}

type Result<T> = std::result::Result<T, PickleError>;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Proto = 0x80,
    Frame = 0x95,
    Stop = b'.',
    Mark = b'(',
    Pop = b'0',
    PopMark = b'1',
    Dup = b'2',
    None = b'N',
    NewTrue = 0x88,
    NewFalse = 0x89,
    Int = b'I',
    BinInt = b'J',
    BinInt1 = b'K',
    BinInt2 = b'M',
    Long = b'L',
    Long1 = 0x8a,
    Long4 = 0x8b,
    Float = b'F',
    BinFloat = b'G',
    String = b'S',
    BinString = b'T',
    ShortBinString = b'U',
    BinBytes = b'B',
    ShortBinBytes = b'C',
    BinBytes8 = 0x8e,
    ByteArray8 = 0x96,
    Unicode = b'V',
    BinUnicode = b'X',
    ShortBinUnicode = 0x8c,
    BinUnicode8 = 0x8d,
    EmptyTuple = b')',
    Tuple = b't',
    Tuple1 = 0x85,
    Tuple2 = 0x86,
    Tuple3 = 0x87,
    EmptyList = b']',
    List = b'l',
    Append = b'a',
    Appends = b'e',
    EmptyDict = b'}',
    Dict = b'd',
    SetItem = b's',
    SetItems = b'u',
    EmptySet = 0x8f,
    AddItems = 0x90,
    FrozenSet = 0x91,
    Global = b'c',
    StackGlobal = 0x93,
    Reduce = b'R',
    Build = b'b',
    Inst = b'i',
    Obj = b'o',
    NewObj = 0x81,
    NewObjEx = 0x92,
    Ext1 = 0x82,
    Ext2 = 0x83,
    Ext4 = 0x84,
    PersId = b'P',
    BinPersId = b'Q',
    Put = b'p',
    BinPut = b'q',
    LongBinPut = b'r',
    Memoize = 0x94,
    Get = b'g',
    BinGet = b'h',
    LongBinGet = b'j',
}

impl TryFrom<u8> for OpCode {
    type Error = u8;
    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        let op = match value {
            0x80 => Self::Proto,
            0x95 => Self::Frame,
            b'.' => Self::Stop,
            b'(' => Self::Mark,
            b'0' => Self::Pop,
            b'1' => Self::PopMark,
            b'2' => Self::Dup,
            b'N' => Self::None,
            0x88 => Self::NewTrue,
            0x89 => Self::NewFalse,
            b'I' => Self::Int,
            b'J' => Self::BinInt,
            b'K' => Self::BinInt1,
            b'M' => Self::BinInt2,
            b'L' => Self::Long,
            0x8a => Self::Long1,
            0x8b => Self::Long4,
            b'F' => Self::Float,
            b'G' => Self::BinFloat,
            b'S' => Self::String,
            b'T' => Self::BinString,
            b'U' => Self::ShortBinString,
            b'B' => Self::BinBytes,
            b'C' => Self::ShortBinBytes,
            0x8e => Self::BinBytes8,
            0x96 => Self::ByteArray8,
            b'V' => Self::Unicode,
            b'X' => Self::BinUnicode,
            0x8c => Self::ShortBinUnicode,
            0x8d => Self::BinUnicode8,
            b')' => Self::EmptyTuple,
            b't' => Self::Tuple,
            0x85 => Self::Tuple1,
            0x86 => Self::Tuple2,
            0x87 => Self::Tuple3,
            b']' => Self::EmptyList,
            b'l' => Self::List,
            b'a' => Self::Append,
            b'e' => Self::Appends,
            b'}' => Self::EmptyDict,
            b'd' => Self::Dict,
            b's' => Self::SetItem,
            b'u' => Self::SetItems,
            0x8f => Self::EmptySet,
            0x90 => Self::AddItems,
            0x91 => Self::FrozenSet,
            b'c' => Self::Global,
            0x93 => Self::StackGlobal,
            b'R' => Self::Reduce,
            b'b' => Self::Build,
            b'i' => Self::Inst,
            b'o' => Self::Obj,
            0x81 => Self::NewObj,
            0x92 => Self::NewObjEx,
            0x82 => Self::Ext1,
            0x83 => Self::Ext2,
            0x84 => Self::Ext4,
            b'P' => Self::PersId,
            b'Q' => Self::BinPersId,
            b'p' => Self::Put,
            b'q' => Self::BinPut,
            b'r' => Self::LongBinPut,
            0x94 => Self::Memoize,
            b'g' => Self::Get,
            b'h' => Self::BinGet,
            b'j' => Self::LongBinGet,
            value => return Err(value),
        };
        Ok(op)
    }
}

/// Allow-listed callables a checkpoint may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callable {
    OrderedDict,
    RebuildTensorV2,
    RebuildParameter,
    RebuildParameterWithState,
    RebuildFromTypeV2,
    Storage(Dtype),
}

/// Reference to a storage blob inside the checkpoint container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRef {
    pub key: String,
    pub dtype: Dtype,
    pub numel: usize,
    /// Element offset into the root storage (legacy storage views).
    pub view_offset: usize,
}

/// A tensor described by its storage, offset, shape and strides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorRef {
    pub storage: StorageRef,
    pub offset: usize,
    pub shape: Vec<usize>,
    pub stride: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Mark,
    None,
    Bool(bool),
    Int(i64),
    /// Integer wider than 64 bits, little-endian two's complement bytes.
    Long(Vec<u8>),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Object>),
    /// Lists and dicts are shared so memo references see later mutations.
    List(Rc<RefCell<Vec<Object>>>),
    Dict(Rc<RefCell<Vec<(Object, Object)>>>),
    Class(Callable),
    Storage(StorageRef),
    Tensor(TensorRef),
    /// Stand-in for any class outside the allow-list.
    Placeholder,
}

impl Object {
    pub fn list(items: Vec<Object>) -> Self {
        Object::List(Rc::new(RefCell::new(items)))
    }

    pub fn dict(items: Vec<(Object, Object)>) -> Self {
        Object::Dict(Rc::new(RefCell::new(items)))
    }

    /// Take the entries of a dict, copying them if the dict is still shared.
    pub fn into_dict(self) -> Option<Vec<(Object, Object)>> {
        match self {
            Object::Dict(items) => Some(unshare(items)),
            _ => None,
        }
    }

    /// Take the items of a list, copying them if the list is still shared.
    pub fn into_list(self) -> Option<Vec<Object>> {
        match self {
            Object::List(items) => Some(unshare(items)),
            _ => None,
        }
    }

    /// Short type name used in log messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Object::Mark => "mark",
            Object::None => "None",
            Object::Bool(_) => "bool",
            Object::Int(_) | Object::Long(_) => "int",
            Object::Float(_) => "float",
            Object::String(_) => "str",
            Object::Bytes(_) => "bytes",
            Object::Tuple(_) => "tuple",
            Object::List(_) => "list",
            Object::Dict(_) => "dict",
            Object::Class(_) => "class",
            Object::Storage(_) => "storage",
            Object::Tensor(_) => "tensor",
            Object::Placeholder => "placeholder",
        }
    }

    fn as_usize(&self) -> Option<usize> {
        match self {
            Object::Int(v) => usize::try_from(*v).ok(),
            _ => None,
        }
    }

    fn as_usize_tuple(&self) -> Option<Vec<usize>> {
        match self {
            Object::Tuple(items) => items.iter().map(Object::as_usize).collect(),
            Object::List(items) => items.borrow().iter().map(Object::as_usize).collect(),
            _ => None,
        }
    }
}

fn unshare<T: Clone>(items: Rc<RefCell<Vec<T>>>) -> Vec<T> {
    Rc::try_unwrap(items)
        .map(RefCell::into_inner)
        .unwrap_or_else(|shared| shared.borrow().clone())
}

/// Map a `torch.<Name>Storage` class name to its element type.
pub fn storage_dtype(name: &str) -> Option<Dtype> {
    let dtype = match name {
        "FloatStorage" => Dtype::F32,
        "DoubleStorage" => Dtype::F64,
        "HalfStorage" => Dtype::F16,
        "BFloat16Storage" => Dtype::BF16,
        "LongStorage" => Dtype::I64,
        "IntStorage" => Dtype::I32,
        "ShortStorage" => Dtype::I16,
        "CharStorage" => Dtype::I8,
        "ByteStorage" | "UntypedStorage" => Dtype::U8,
        "BoolStorage" => Dtype::BOOL,
        "Float8_e5m2Storage" => Dtype::F8_E5M2,
        "Float8_e4m3fnStorage" => Dtype::F8_E4M3,
        _ => return None,
    };
    Some(dtype)
}

/// Inverse of [`storage_dtype`], used by the writer.
pub fn storage_name(dtype: Dtype) -> Option<&'static str> {
    let name = match dtype {
        Dtype::F32 => "FloatStorage",
        Dtype::F64 => "DoubleStorage",
        Dtype::F16 => "HalfStorage",
        Dtype::BF16 => "BFloat16Storage",
        Dtype::I64 => "LongStorage",
        Dtype::I32 => "IntStorage",
        Dtype::I16 => "ShortStorage",
        Dtype::I8 => "CharStorage",
        Dtype::U8 => "ByteStorage",
        Dtype::BOOL => "BoolStorage",
        Dtype::F8_E5M2 => "Float8_e5m2Storage",
        Dtype::F8_E4M3 => "Float8_e4m3fnStorage",
        _ => return None,
    };
    Some(name)
}

fn resolve_class(module: &str, name: &str) -> Option<Callable> {
    match (module, name) {
        ("collections", "OrderedDict") => Some(Callable::OrderedDict),
        ("torch._utils", "_rebuild_tensor_v2") => Some(Callable::RebuildTensorV2),
        ("torch._utils", "_rebuild_parameter") => Some(Callable::RebuildParameter),
        ("torch._utils", "_rebuild_parameter_with_state") => {
            Some(Callable::RebuildParameterWithState)
        }
        ("torch._tensor", "_rebuild_from_type_v2") => Some(Callable::RebuildFromTypeV2),
        ("torch", name) => storage_dtype(name).map(Callable::Storage),
        _ => None,
    }
}

fn read_to_newline<R: BufRead>(r: &mut R) -> Result<Vec<u8>> {
    let mut data: Vec<u8> = Vec::with_capacity(32);
    r.read_until(b'\n', &mut data)?;
    if data.pop() != Some(b'\n') {
        return Err(PickleError::InvalidData("unterminated line".to_string()));
    }
    if data.last() == Some(&b'\r') {
        data.pop();
    }
    Ok(data)
}

fn buf_to_str(buf: Vec<u8>) -> Result<String> {
    String::from_utf8(buf).map_err(|e| PickleError::InvalidData(format!("Invalid UTF-8: {}", e)))
}

/// Decode the quoted `repr` literal carried by the protocol-0 STRING opcode.
fn decode_string_escape(line: &[u8]) -> Result<String> {
    let body = match line {
        [q @ (b'\'' | b'"'), body @ .., end] if end == q => body,
        _ => return Err(PickleError::InvalidData("STRING argument is not quoted".to_string())),
    };

    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        let b = body[i];
        i += 1;
        if b != b'\\' {
            out.push(b);
            continue;
        }
        let Some(&esc) = body.get(i) else {
            return Err(PickleError::InvalidData("trailing backslash in STRING".to_string()));
        };
        i += 1;
        match esc {
            b'\\' | b'\'' | b'"' => out.push(esc),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'v' => out.push(0x0b),
            b'x' => {
                let value = body
                    .get(i..i + 2)
                    .and_then(|hex| std::str::from_utf8(hex).ok())
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                    .ok_or_else(|| PickleError::InvalidData("invalid \\x escape in STRING".to_string()))?;
                out.push(value);
                i += 2;
            }
            b'0'..=b'7' => {
                let mut value = (esc - b'0') as u32;
                let mut digits = 1;
                while digits < 3 {
                    match body.get(i) {
                        Some(&d @ b'0'..=b'7') => {
                            value = value * 8 + (d - b'0') as u32;
                            i += 1;
                            digits += 1;
                        }
                        _ => break,
                    }
                }
                out.push(value as u8);
            }
            other => {
                out.push(b'\\');
                out.push(other);
            }
        }
    }

    // Python 2 str payloads are bytes; fall back to latin-1 when not UTF-8.
    Ok(String::from_utf8(out).unwrap_or_else(|e| e.into_bytes().iter().map(|&b| b as char).collect()))
}

/// Decode `raw-unicode-escape` text from the protocol-0 UNICODE opcode:
/// latin-1 bytes where only `\uXXXX` and `\UXXXXXXXX` are escapes.
fn decode_raw_unicode_escape(line: &[u8]) -> Result<String> {
    let mut out = String::with_capacity(line.len());
    let mut i = 0;
    while i < line.len() {
        let b = line[i];
        let width = match (b, line.get(i + 1)) {
            (b'\\', Some(b'u')) => 4,
            (b'\\', Some(b'U')) => 8,
            _ => 0,
        };
        if width == 0 {
            out.push(b as char);
            i += 1;
            continue;
        }
        let c = line
            .get(i + 2..i + 2 + width)
            .and_then(|hex| std::str::from_utf8(hex).ok())
            .and_then(|hex| u32::from_str_radix(hex, 16).ok())
            .and_then(char::from_u32)
            .ok_or_else(|| PickleError::InvalidData("invalid unicode escape in UNICODE".to_string()))?;
        out.push(c);
        i += 2 + width;
    }
    Ok(out)
}

fn read_bytes<R: BufRead>(r: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut data = vec![0u8; len];
    r.read_exact(&mut data)?;
    Ok(data)
}

/// Decode a little-endian two's complement integer.
fn decode_long(data: Vec<u8>) -> Object {
    if data.len() > 8 {
        return Object::Long(data);
    }
    let mut value = 0i64;
    for (i, &byte) in data.iter().enumerate() {
        value |= (byte as i64) << (i * 8);
    }
    if let Some(&last) = data.last() {
        if last & 0x80 != 0 && data.len() < 8 {
            value -= 1i64 << (data.len() * 8);
        }
    }
    Object::Int(value)
}

fn parse_text_int(line: &[u8]) -> Result<Object> {
    let s = std::str::from_utf8(line)
        .map_err(|e| PickleError::InvalidData(format!("Invalid UTF-8: {}", e)))?
        .trim_end_matches('L');
    match s {
        "00" => Ok(Object::Bool(false)),
        "01" => Ok(Object::Bool(true)),
        _ => s
            .parse::<i64>()
            .map(Object::Int)
            .map_err(|e| PickleError::InvalidData(format!("Invalid INT value '{}': {}", s, e))),
    }
}

/// Unpickler state: value stack, memo, and the storages seen so far.
pub struct Unpickler {
    stack: Vec<Object>,
    memo: HashMap<u32, Object>,
    storages: HashMap<String, Dtype>,
    unresolved: HashSet<(String, String)>,
}

impl Default for Unpickler {
    fn default() -> Self {
        Self::new()
    }
}

impl Unpickler {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            memo: HashMap::new(),
            storages: HashMap::new(),
            unresolved: HashSet::new(),
        }
    }

    /// Every storage referenced by persistent id, across all pickles read.
    pub fn storages(&self) -> &HashMap<String, Dtype> {
        &self.storages
    }

    fn push(&mut self, o: Object) {
        self.stack.push(o)
    }

    fn pop(&mut self) -> Result<Object> {
        self.stack.pop().ok_or(PickleError::StackUnderflow)
    }

    fn top(&self) -> Result<Object> {
        self.stack.last().cloned().ok_or(PickleError::StackUnderflow)
    }

    fn last_mut(&mut self) -> Result<&mut Object> {
        self.stack.last_mut().ok_or(PickleError::StackUnderflow)
    }

    fn pop_to_marker(&mut self) -> Result<Vec<Object>> {
        let marker_pos = self
            .stack
            .iter()
            .rposition(|o| matches!(o, Object::Mark))
            .ok_or_else(|| PickleError::InvalidData("marker not found".to_string()))?;
        let result = self.stack.split_off(marker_pos + 1);
        self.stack.pop();
        Ok(result)
    }

    fn memo_get(&self, idx: u32) -> Result<Object> {
        self.memo.get(&idx).cloned().ok_or(PickleError::MemoNotFound(idx))
    }

    fn memo_put(&mut self, idx: u32) -> Result<()> {
        let obj = self.top()?;
        self.memo.insert(idx, obj);
        Ok(())
    }

    fn global(&mut self, module: String, name: String) {
        let obj = match resolve_class(&module, &name) {
            Some(callable) => Object::Class(callable),
            None => {
                if self.unresolved.insert((module.clone(), name.clone())) {
                    warn!(module = %module, name = %name, "unresolvable class, using placeholder");
                }
                Object::Placeholder
            }
        };
        self.push(obj);
    }

    fn persistent_load(&mut self, pid: Object) -> Object {
        // ('storage', storage_type, key, location, numel[, view_metadata])
        let Object::Tuple(items) = pid else {
            return Object::Placeholder;
        };
        match items.as_slice() {
            [Object::String(tag), Object::Class(Callable::Storage(dtype)), Object::String(key), _, numel, rest @ ..]
                if tag == "storage" =>
            {
                let view_offset = match rest.first() {
                    Some(Object::Tuple(view)) => view.get(1).and_then(Object::as_usize).unwrap_or(0),
                    _ => 0,
                };
                self.storages.insert(key.clone(), *dtype);
                Object::Storage(StorageRef {
                    key: key.clone(),
                    dtype: *dtype,
                    numel: numel.as_usize().unwrap_or(0),
                    view_offset,
                })
            }
            _ => Object::Placeholder,
        }
    }

    fn call(&mut self, callable: Object, args: Object) -> Object {
        let Object::Class(callable) = callable else {
            return Object::Placeholder;
        };
        let args = match args {
            Object::Tuple(args) => args,
            _ => return Object::Placeholder,
        };
        match callable {
            Callable::OrderedDict => match args.into_iter().next().and_then(Object::into_list) {
                Some(pairs) => Object::dict(
                    pairs
                        .into_iter()
                        .filter_map(|pair| match pair {
                            Object::Tuple(kv) if kv.len() == 2 => {
                                let mut kv = kv.into_iter();
                                Some((kv.next()?, kv.next()?))
                            }
                            _ => None,
                        })
                        .collect(),
                ),
                None => Object::dict(Vec::new()),
            },
            Callable::RebuildTensorV2 => rebuild_tensor(&args),
            Callable::RebuildParameter | Callable::RebuildParameterWithState => match args.into_iter().next() {
                Some(tensor @ Object::Tensor(_)) => tensor,
                _ => Object::Placeholder,
            },
            Callable::RebuildFromTypeV2 => {
                // (func, new_type, args, state)
                let mut args = args.into_iter();
                match (args.next(), args.next(), args.next()) {
                    (Some(func), Some(_), Some(inner)) => self.call(func, inner),
                    _ => Object::Placeholder,
                }
            }
            Callable::Storage(_) => Object::Placeholder,
        }
    }

    /// Read one pickle from `r`, up to and including its STOP opcode.
    pub fn load<R: BufRead>(&mut self, r: &mut R) -> Result<Object> {
        self.stack.clear();
        self.memo.clear();
        loop {
            let op_code = r.read_u8()?;
            let op_code = OpCode::try_from(op_code).map_err(PickleError::InvalidOpCode)?;
            match op_code {
                OpCode::Proto => {
                    let version = r.read_u8()?;
                    if version > 5 {
                        return Err(PickleError::InvalidProtocol(version));
                    }
                }
                OpCode::Frame => {
                    r.read_u64::<LittleEndian>()?;
                }
                OpCode::Stop => break,
                OpCode::Mark => self.push(Object::Mark),
                OpCode::Pop => {
                    self.pop()?;
                }
                OpCode::PopMark => {
                    self.pop_to_marker()?;
                }
                OpCode::Dup => {
                    let obj = self.top()?;
                    self.push(obj);
                }
                OpCode::None => self.push(Object::None),
                OpCode::NewTrue => self.push(Object::Bool(true)),
                OpCode::NewFalse => self.push(Object::Bool(false)),
                OpCode::Int => {
                    let line = read_to_newline(r)?;
                    let obj = parse_text_int(&line)?;
                    self.push(obj);
                }
                OpCode::Long => {
                    let line = read_to_newline(r)?;
                    let obj = parse_text_int(&line)?;
                    self.push(obj);
                }
                OpCode::BinInt => {
                    let v = r.read_i32::<LittleEndian>()?;
                    self.push(Object::Int(v as i64));
                }
                OpCode::BinInt1 => {
                    let v = r.read_u8()?;
                    self.push(Object::Int(v as i64));
                }
                OpCode::BinInt2 => {
                    let v = r.read_u16::<LittleEndian>()?;
                    self.push(Object::Int(v as i64));
                }
                OpCode::Long1 => {
                    let len = r.read_u8()? as usize;
                    let data = read_bytes(r, len)?;
                    self.push(decode_long(data));
                }
                OpCode::Long4 => {
                    let len = r.read_u32::<LittleEndian>()? as usize;
                    let data = read_bytes(r, len)?;
                    self.push(decode_long(data));
                }
                OpCode::Float => {
                    let line = buf_to_str(read_to_newline(r)?)?;
                    let v = line.parse::<f64>().map_err(|e| {
                        PickleError::InvalidData(format!("Invalid FLOAT value '{}': {}", line, e))
                    })?;
                    self.push(Object::Float(v));
                }
                OpCode::BinFloat => {
                    // BINFLOAT is big-endian
                    let v = r.read_f64::<BigEndian>()?;
                    self.push(Object::Float(v));
                }
                OpCode::String => {
                    let line = read_to_newline(r)?;
                    let s = decode_string_escape(&line)?;
                    self.push(Object::String(s));
                }
                OpCode::BinString => {
                    let len = r.read_u32::<LittleEndian>()? as usize;
                    let s = buf_to_str(read_bytes(r, len)?)?;
                    self.push(Object::String(s));
                }
                OpCode::ShortBinString => {
                    let len = r.read_u8()? as usize;
                    let s = buf_to_str(read_bytes(r, len)?)?;
                    self.push(Object::String(s));
                }
                OpCode::BinBytes => {
                    let len = r.read_u32::<LittleEndian>()? as usize;
                    let data = read_bytes(r, len)?;
                    self.push(Object::Bytes(data));
                }
                OpCode::ShortBinBytes => {
                    let len = r.read_u8()? as usize;
                    let data = read_bytes(r, len)?;
                    self.push(Object::Bytes(data));
                }
                OpCode::BinBytes8 | OpCode::ByteArray8 => {
                    let len = r.read_u64::<LittleEndian>()? as usize;
                    let data = read_bytes(r, len)?;
                    self.push(Object::Bytes(data));
                }
                OpCode::Unicode => {
                    let line = read_to_newline(r)?;
                    let s = decode_raw_unicode_escape(&line)?;
                    self.push(Object::String(s));
                }
                OpCode::BinUnicode => {
                    let len = r.read_u32::<LittleEndian>()? as usize;
                    let s = buf_to_str(read_bytes(r, len)?)?;
                    self.push(Object::String(s));
                }
                OpCode::ShortBinUnicode => {
                    let len = r.read_u8()? as usize;
                    let s = buf_to_str(read_bytes(r, len)?)?;
                    self.push(Object::String(s));
                }
                OpCode::BinUnicode8 => {
                    let len = r.read_u64::<LittleEndian>()? as usize;
                    let s = buf_to_str(read_bytes(r, len)?)?;
                    self.push(Object::String(s));
                }
                OpCode::EmptyTuple => self.push(Object::Tuple(Vec::new())),
                OpCode::Tuple => {
                    let objs = self.pop_to_marker()?;
                    self.push(Object::Tuple(objs));
                }
                OpCode::Tuple1 => {
                    let obj = self.pop()?;
                    self.push(Object::Tuple(vec![obj]));
                }
                OpCode::Tuple2 => {
                    let obj2 = self.pop()?;
                    let obj1 = self.pop()?;
                    self.push(Object::Tuple(vec![obj1, obj2]));
                }
                OpCode::Tuple3 => {
                    let obj3 = self.pop()?;
                    let obj2 = self.pop()?;
                    let obj1 = self.pop()?;
                    self.push(Object::Tuple(vec![obj1, obj2, obj3]));
                }
                OpCode::EmptyList | OpCode::EmptySet => self.push(Object::list(Vec::new())),
                OpCode::List => {
                    let objs = self.pop_to_marker()?;
                    self.push(Object::list(objs));
                }
                OpCode::FrozenSet => {
                    let objs = self.pop_to_marker()?;
                    self.push(Object::list(objs));
                }
                OpCode::Append => {
                    let value = self.pop()?;
                    match self.last_mut()? {
                        Object::List(list) => list.borrow_mut().push(value),
                        Object::Placeholder => {}
                        _ => return Err(PickleError::UnexpectedOpCode(op_code)),
                    }
                }
                OpCode::Appends | OpCode::AddItems => {
                    let objs = self.pop_to_marker()?;
                    match self.last_mut()? {
                        Object::List(list) => list.borrow_mut().extend(objs),
                        Object::Placeholder => {}
                        _ => return Err(PickleError::UnexpectedOpCode(op_code)),
                    }
                }
                OpCode::EmptyDict => self.push(Object::dict(Vec::new())),
                OpCode::Dict => {
                    let objs = self.pop_to_marker()?;
                    let dict = pairs(objs)?;
                    self.push(Object::dict(dict));
                }
                OpCode::SetItem => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    match self.last_mut()? {
                        Object::Dict(dict) => dict.borrow_mut().push((key, value)),
                        Object::Placeholder => {}
                        _ => return Err(PickleError::UnexpectedOpCode(op_code)),
                    }
                }
                OpCode::SetItems => {
                    let objs = self.pop_to_marker()?;
                    let items = pairs(objs)?;
                    match self.last_mut()? {
                        Object::Dict(dict) => dict.borrow_mut().extend(items),
                        Object::Placeholder => {}
                        _ => return Err(PickleError::UnexpectedOpCode(op_code)),
                    }
                }
                OpCode::Global => {
                    let module = buf_to_str(read_to_newline(r)?)?;
                    let name = buf_to_str(read_to_newline(r)?)?;
                    self.global(module, name);
                }
                OpCode::StackGlobal => {
                    let name = self.pop()?;
                    let module = self.pop()?;
                    match (module, name) {
                        (Object::String(module), Object::String(name)) => self.global(module, name),
                        _ => return Err(PickleError::UnexpectedOpCode(op_code)),
                    }
                }
                OpCode::Reduce => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let obj = self.call(callable, args);
                    self.push(obj);
                }
                OpCode::Build => {
                    // Instance state is irrelevant to tensors and dicts.
                    self.pop()?;
                }
                OpCode::Inst => {
                    read_to_newline(r)?;
                    read_to_newline(r)?;
                    self.pop_to_marker()?;
                    self.push(Object::Placeholder);
                }
                OpCode::Obj => {
                    let mut objs = self.pop_to_marker()?;
                    let cls = if objs.is_empty() { Object::Placeholder } else { objs.remove(0) };
                    let obj = match cls {
                        Object::Class(Callable::OrderedDict) => Object::dict(Vec::new()),
                        _ => Object::Placeholder,
                    };
                    self.push(obj);
                }
                OpCode::NewObj => {
                    self.pop()?;
                    let cls = self.pop()?;
                    let obj = match cls {
                        Object::Class(Callable::OrderedDict) => Object::dict(Vec::new()),
                        _ => Object::Placeholder,
                    };
                    self.push(obj);
                }
                OpCode::NewObjEx => {
                    self.pop()?;
                    self.pop()?;
                    let cls = self.pop()?;
                    let obj = match cls {
                        Object::Class(Callable::OrderedDict) => Object::dict(Vec::new()),
                        _ => Object::Placeholder,
                    };
                    self.push(obj);
                }
                OpCode::Ext1 => {
                    r.read_u8()?;
                    self.push(Object::Placeholder);
                }
                OpCode::Ext2 => {
                    r.read_u16::<LittleEndian>()?;
                    self.push(Object::Placeholder);
                }
                OpCode::Ext4 => {
                    r.read_u32::<LittleEndian>()?;
                    self.push(Object::Placeholder);
                }
                OpCode::PersId => {
                    read_to_newline(r)?;
                    self.push(Object::Placeholder);
                }
                OpCode::BinPersId => {
                    let pid = self.pop()?;
                    let obj = self.persistent_load(pid);
                    self.push(obj);
                }
                OpCode::Put => {
                    let line = buf_to_str(read_to_newline(r)?)?;
                    let idx = line.parse::<u32>().map_err(|e| {
                        PickleError::InvalidData(format!("Invalid PUT index '{}': {}", line, e))
                    })?;
                    self.memo_put(idx)?;
                }
                OpCode::BinPut => {
                    let idx = r.read_u8()? as u32;
                    self.memo_put(idx)?;
                }
                OpCode::LongBinPut => {
                    let idx = r.read_u32::<LittleEndian>()?;
                    self.memo_put(idx)?;
                }
                OpCode::Memoize => {
                    let idx = self.memo.len() as u32;
                    self.memo_put(idx)?;
                }
                OpCode::Get => {
                    let line = buf_to_str(read_to_newline(r)?)?;
                    let idx = line.parse::<u32>().map_err(|e| {
                        PickleError::InvalidData(format!("Invalid GET index '{}': {}", line, e))
                    })?;
                    let obj = self.memo_get(idx)?;
                    self.push(obj);
                }
                OpCode::BinGet => {
                    let idx = r.read_u8()? as u32;
                    let obj = self.memo_get(idx)?;
                    self.push(obj);
                }
                OpCode::LongBinGet => {
                    let idx = r.read_u32::<LittleEndian>()?;
                    let obj = self.memo_get(idx)?;
                    self.push(obj);
                }
            }
        }
        self.pop()
    }
}

fn pairs(objs: Vec<Object>) -> Result<Vec<(Object, Object)>> {
    if objs.len() % 2 != 0 {
        return Err(PickleError::InvalidData(
            "dict requires an even number of objects".to_string(),
        ));
    }
    let mut items = Vec::with_capacity(objs.len() / 2);
    let mut iter = objs.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        items.push((key, value));
    }
    Ok(items)
}

/// `_rebuild_tensor_v2(storage, storage_offset, size, stride, requires_grad, hooks, ...)`
fn rebuild_tensor(args: &[Object]) -> Object {
    let (Some(Object::Storage(storage)), Some(offset), Some(shape), Some(stride)) = (
        args.first(),
        args.get(1).and_then(Object::as_usize),
        args.get(2).and_then(Object::as_usize_tuple),
        args.get(3).and_then(Object::as_usize_tuple),
    ) else {
        return Object::Placeholder;
    };
    if shape.len() != stride.len() {
        return Object::Placeholder;
    }
    Object::Tensor(TensorRef {
        storage: storage.clone(),
        offset,
        shape,
        stride,
    })
}

/// Read a single pickle with a fresh unpickler.
pub fn read_pickle<R: BufRead>(r: &mut R) -> Result<Object> {
    Unpickler::new().load(r)
}
