//! PyTorch checkpoint container (`torch.save` / `torch.load` files).
//!
//! Reads the zip container used since PyTorch 1.6 and the older
//! single-stream layout. Writes the zip container.

pub mod pickle;
pub mod writer;

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Cursor, Read, Seek, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::checkpoint::{Checkpoint, Layout, TensorMap, STATE_DICT_KEY};
use crate::error::{CheckpointError, Result};
use crate::tensor::{element_size, Tensor};

use pickle::{Object, TensorRef, Unpickler};
use writer::Pickler;

/// Archive directory name used when writing.
const ARCHIVE_NAME: &str = "archive";

/// Serialization format version written to `<archive>/version`.
const FORMAT_VERSION: &str = "3\n";

const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";

/// `torch.serialization.MAGIC_NUMBER` as little-endian bytes.
const LEGACY_MAGIC: [u8; 10] = [0x6c, 0xfc, 0x9c, 0x46, 0xf9, 0x20, 0x6a, 0xa8, 0x50, 0x19];

const LEGACY_PROTOCOL_VERSION: i64 = 1001;

/// Load a PyTorch checkpoint file.
pub fn load(path: &Path) -> Result<Checkpoint> {
    let mut file = BufReader::new(File::open(path)?);
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    file.rewind()?;

    if magic == ZIP_MAGIC {
        load_zip(file)
    } else {
        load_legacy(file)
    }
}

/// Load from an in-memory zip container.
pub fn load_bytes(data: &[u8]) -> Result<Checkpoint> {
    load_zip(Cursor::new(data))
}

fn load_zip<R: Read + Seek>(reader: R) -> Result<Checkpoint> {
    let mut archive = ZipArchive::new(reader)?;

    let pkl_name = archive
        .file_names()
        .filter(|name| name.ends_with("data.pkl"))
        .min_by_key(|name| name.len())
        .map(str::to_string)
        .ok_or_else(|| CheckpointError::UnknownContainer("zip archive without data.pkl".to_string()))?;
    let prefix = pkl_name.trim_end_matches("data.pkl").to_string();
    debug!(entry = %pkl_name, "reading pickle");

    let mut pkl = Vec::new();
    archive.by_name(&pkl_name)?.read_to_end(&mut pkl)?;
    let root = Unpickler::new().load(&mut Cursor::new(pkl))?;

    let (layout, refs) = collect_tensor_refs(root)?;
    let tensors = materialize_all(refs, |key| {
        let name = format!("{prefix}data/{key}");
        let mut entry = archive.by_name(&name).map_err(|e| match e {
            zip::result::ZipError::FileNotFound => CheckpointError::MissingStorage {
                key: key.to_string(),
            },
            other => other.into(),
        })?;
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        Ok(data)
    })?;

    Ok(Checkpoint::new(layout, tensors))
}

fn load_legacy<R: Read + Seek>(reader: R) -> Result<Checkpoint> {
    let mut reader = BufReader::new(reader);
    let mut unpickler = Unpickler::new();

    match unpickler.load(&mut reader) {
        Ok(Object::Long(bytes)) if bytes == LEGACY_MAGIC => {}
        _ => {
            return Err(CheckpointError::UnknownContainer(
                "neither a zip archive nor a legacy torch file".to_string(),
            ))
        }
    }
    match unpickler.load(&mut reader)? {
        Object::Int(LEGACY_PROTOCOL_VERSION) => {}
        other => {
            return Err(CheckpointError::UnknownContainer(format!(
                "unsupported legacy protocol version {:?}",
                other
            )))
        }
    }
    // sys_info
    unpickler.load(&mut reader)?;
    let root = unpickler.load(&mut reader)?;
    let keys = unpickler.load(&mut reader)?;
    let kind = keys.kind();
    let keys = keys.into_list().ok_or_else(|| {
        CheckpointError::UnknownContainer(format!("expected storage key list, found {}", kind))
    })?;

    let mut blobs: HashMap<String, Vec<u8>> = HashMap::with_capacity(keys.len());
    for key in keys {
        let Object::String(key) = key else {
            return Err(CheckpointError::UnknownContainer("non-string storage key".to_string()));
        };
        let dtype = *unpickler
            .storages()
            .get(&key)
            .ok_or_else(|| CheckpointError::MissingStorage { key: key.clone() })?;
        let numel = reader.read_u64::<LittleEndian>()?;
        let nbytes = numel
            .checked_mul(element_size(dtype)? as u64)
            .ok_or_else(|| CheckpointError::SizeOverflow { key: key.clone() })?;
        // Read through `take` so a corrupt count cannot force a huge allocation.
        let mut data = Vec::new();
        (&mut reader).take(nbytes).read_to_end(&mut data)?;
        if data.len() as u64 != nbytes {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        blobs.insert(key, data);
    }

    let (layout, refs) = collect_tensor_refs(root)?;
    let tensors = materialize_all(refs, |key| {
        blobs
            .remove(key)
            .ok_or_else(|| CheckpointError::MissingStorage { key: key.to_string() })
    })?;
    Ok(Checkpoint::new(layout, tensors))
}

/// Split the unpickled root into layout and named tensor references.
fn collect_tensor_refs(root: Object) -> Result<(Layout, Vec<(String, TensorRef)>)> {
    let kind = root.kind();
    let mut items = root.into_dict().ok_or(CheckpointError::NotADict(kind))?;

    let mut layout = Layout::Flat;
    let nested = items.iter().position(|(k, v)| {
        matches!(k, Object::String(k) if k == STATE_DICT_KEY) && matches!(v, Object::Dict(_))
    });
    if let Some(idx) = nested {
        if let Some(inner) = items.swap_remove(idx).1.into_dict() {
            layout = Layout::Nested;
            items = inner;
        }
    }

    let mut refs = Vec::with_capacity(items.len());
    for (key, value) in items {
        match (key, value) {
            (Object::String(key), Object::Tensor(t)) => refs.push((key, t)),
            (Object::String(key), Object::Placeholder) => {
                warn!(key = %key, "skipping entry with unresolvable value");
            }
            (key, value) => {
                debug!(key = ?key, kind = value.kind(), "skipping non-tensor entry");
            }
        }
    }
    Ok((layout, refs))
}

/// Materialize tensors one storage at a time so each blob is dropped early.
fn materialize_all<F>(refs: Vec<(String, TensorRef)>, mut read_storage: F) -> Result<TensorMap>
where
    F: FnMut(&str) -> Result<Vec<u8>>,
{
    let mut by_storage: HashMap<String, Vec<(String, TensorRef)>> = HashMap::new();
    for (name, r) in refs {
        by_storage.entry(r.storage.key.clone()).or_default().push((name, r));
    }

    let mut storage_keys: Vec<String> = by_storage.keys().cloned().collect();
    storage_keys.sort_unstable();

    let mut tensors = TensorMap::new();
    for key in storage_keys {
        let blob = read_storage(&key)?;
        for (name, r) in by_storage.remove(&key).unwrap_or_default() {
            let tensor = materialize(&r, &blob)?;
            tensors.insert(name, tensor);
        }
    }
    info!(tensors = tensors.len(), "loaded torch checkpoint");
    Ok(tensors)
}

/// Copy a (possibly strided) tensor view out of its storage bytes.
pub fn materialize(r: &TensorRef, storage: &[u8]) -> Result<Tensor> {
    let dtype = r.storage.dtype;
    let esize = element_size(dtype)?;
    let overflow = || CheckpointError::SizeOverflow {
        key: r.storage.key.clone(),
    };

    let base = r
        .storage
        .view_offset
        .checked_add(r.offset)
        .ok_or_else(overflow)?;
    let numel = r
        .shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(overflow)?;
    let nbytes = numel.checked_mul(esize).ok_or_else(overflow)?;

    if numel == 0 {
        return Tensor::new(dtype, r.shape.clone(), Vec::new());
    }

    // Index of the last element the view touches.
    let last = r
        .shape
        .iter()
        .zip(&r.stride)
        .try_fold(base, |acc, (&dim, &stride)| {
            (dim - 1).checked_mul(stride).and_then(|span| acc.checked_add(span))
        })
        .ok_or_else(overflow)?;
    let needed = last
        .checked_add(1)
        .and_then(|n| n.checked_mul(esize))
        .ok_or_else(overflow)?;
    if needed > storage.len() {
        return Err(CheckpointError::StorageOutOfBounds {
            key: r.storage.key.clone(),
            needed,
            available: storage.len(),
        });
    }

    if is_contiguous(&r.shape, &r.stride) {
        let start = base * esize;
        let data = storage[start..start + nbytes].to_vec();
        return Tensor::new(dtype, r.shape.clone(), data);
    }

    let mut data = Vec::with_capacity(nbytes);
    let mut index = vec![0usize; r.shape.len()];
    for _ in 0..numel {
        let elem = base + index.iter().zip(&r.stride).map(|(i, s)| i * s).sum::<usize>();
        data.extend_from_slice(&storage[elem * esize..(elem + 1) * esize]);
        for dim in (0..index.len()).rev() {
            index[dim] += 1;
            if index[dim] < r.shape[dim] {
                break;
            }
            index[dim] = 0;
        }
    }
    Tensor::new(dtype, r.shape.clone(), data)
}

fn is_contiguous(shape: &[usize], stride: &[usize]) -> bool {
    let mut expected = 1;
    for (&dim, &s) in shape.iter().zip(stride).rev() {
        if dim != 1 && s != expected {
            return false;
        }
        expected *= dim;
    }
    true
}

/// Write a checkpoint as a PyTorch zip container.
pub fn save(checkpoint: &Checkpoint, path: &Path) -> Result<()> {
    let file = BufWriter::new(File::create(path)?);
    let mut zip = write_zip(checkpoint, file)?;
    zip.flush()?;
    Ok(())
}

/// Serialize a checkpoint to an in-memory zip container.
pub fn save_bytes(checkpoint: &Checkpoint) -> Result<Vec<u8>> {
    let cursor = write_zip(checkpoint, Cursor::new(Vec::new()))?;
    Ok(cursor.into_inner())
}

fn write_zip<W: Write + Seek>(checkpoint: &Checkpoint, writer: W) -> Result<W> {
    let mut pickler = Pickler::new();
    if checkpoint.is_nested() {
        pickler.empty_dict();
        pickler.unicode(STATE_DICT_KEY);
    }
    pickler.empty_dict();
    let tensors: Vec<(&String, &Tensor)> = checkpoint.tensors().iter().collect();
    if !tensors.is_empty() {
        pickler.mark();
        for (idx, (name, tensor)) in tensors.iter().enumerate() {
            pickler.unicode(name);
            pickler.tensor(tensor, &idx.to_string())?;
        }
        pickler.set_items();
    }
    if checkpoint.is_nested() {
        pickler.set_item();
    }
    let pkl = pickler.finish();

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let mut zip = ZipWriter::new(writer);

    zip.start_file(format!("{ARCHIVE_NAME}/data.pkl"), options)?;
    zip.write_all(&pkl)?;
    zip.start_file(format!("{ARCHIVE_NAME}/byteorder"), options)?;
    zip.write_all(b"little")?;

    for (idx, (_, tensor)) in tensors.iter().enumerate() {
        let large = tensor.nbytes() as u64 >= u32::MAX as u64;
        zip.start_file(
            format!("{ARCHIVE_NAME}/data/{idx}"),
            options.large_file(large),
        )?;
        zip.write_all(tensor.data())?;
    }

    zip.start_file(format!("{ARCHIVE_NAME}/version"), options)?;
    zip.write_all(FORMAT_VERSION.as_bytes())?;

    Ok(zip.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::pickle::{OpCode, StorageRef};
    use safetensors::Dtype;

    fn sample(layout: Layout) -> Checkpoint {
        let mut map = TensorMap::new();
        map.insert(
            "model.diffusion_model.w".into(),
            Tensor::from_f32(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap(),
        );
        map.insert(
            "cond_stage_model.ids".into(),
            Tensor::new(Dtype::I64, vec![3], [0i64, 1, 2].iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>()).unwrap(),
        );
        map.insert("first_stage_model.scale".into(), Tensor::from_f32(vec![], &[0.5]).unwrap());
        map.insert("depth_model.empty".into(), Tensor::from_f32(vec![0, 4], &[]).unwrap());
        Checkpoint::new(layout, map)
    }

    fn storage_ref(numel: usize) -> StorageRef {
        StorageRef {
            key: "0".into(),
            dtype: Dtype::F32,
            numel,
            view_offset: 0,
        }
    }

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Opcodes emitted by `build`, without the protocol header and STOP.
    fn ops(build: impl FnOnce(&mut Pickler)) -> Vec<u8> {
        let mut p = Pickler::new();
        build(&mut p);
        let bytes = p.finish();
        bytes[2..bytes.len() - 1].to_vec()
    }

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = ZipWriter::new(&mut buf);
            let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
            for (name, data) in entries {
                zip.start_file(*name, options).unwrap();
                zip.write_all(data).unwrap();
            }
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn test_zip_round_trip_nested_and_flat() {
        for layout in [Layout::Flat, Layout::Nested] {
            let ckpt = sample(layout);
            let bytes = save_bytes(&ckpt).unwrap();
            let loaded = load_bytes(&bytes).unwrap();
            assert_eq!(loaded, ckpt);
        }
    }

    #[test]
    fn test_empty_round_trip() {
        let ckpt = Checkpoint::nested(TensorMap::new());
        let loaded = load_bytes(&save_bytes(&ckpt).unwrap()).unwrap();
        assert_eq!(loaded, ckpt);
    }

    #[test]
    fn test_archive_layout() {
        let bytes = save_bytes(&sample(Layout::Flat)).unwrap();
        let archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut names: Vec<&str> = archive.file_names().collect();
        names.sort_unstable();
        assert_eq!(
            names,
            [
                "archive/byteorder",
                "archive/data.pkl",
                "archive/data/0",
                "archive/data/1",
                "archive/data/2",
                "archive/data/3",
                "archive/version",
            ]
        );
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("model.ckpt");
        let ckpt = sample(Layout::Nested);
        save(&ckpt, &path).unwrap();
        assert_eq!(load(&path).unwrap(), ckpt);
    }

    #[test]
    fn test_garbage_file_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("model.ckpt");
        std::fs::write(&path, b"definitely not a checkpoint").unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn test_materialize_contiguous_with_offset() {
        let storage = f32_bytes(&[0.0, 1.0, 2.0, 3.0, 4.0]);
        let r = TensorRef {
            storage: storage_ref(5),
            offset: 1,
            shape: vec![2, 2],
            stride: vec![2, 1],
        };
        let t = materialize(&r, &storage).unwrap();
        assert_eq!(t.data(), f32_bytes(&[1.0, 2.0, 3.0, 4.0]).as_slice());
    }

    #[test]
    fn test_materialize_transposed_view() {
        // storage holds [[0, 1, 2], [3, 4, 5]]; view is its transpose
        let storage = f32_bytes(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let r = TensorRef {
            storage: storage_ref(6),
            offset: 0,
            shape: vec![3, 2],
            stride: vec![1, 3],
        };
        let t = materialize(&r, &storage).unwrap();
        assert_eq!(t.shape(), &[3, 2]);
        assert_eq!(t.data(), f32_bytes(&[0.0, 3.0, 1.0, 4.0, 2.0, 5.0]).as_slice());
    }

    #[test]
    fn test_materialize_out_of_bounds() {
        let storage = f32_bytes(&[0.0, 1.0]);
        let r = TensorRef {
            storage: storage_ref(2),
            offset: 1,
            shape: vec![2],
            stride: vec![1],
        };
        assert!(matches!(
            materialize(&r, &storage),
            Err(CheckpointError::StorageOutOfBounds { needed: 12, available: 8, .. })
        ));
    }

    #[test]
    fn test_materialize_size_overflow() {
        let storage = f32_bytes(&[0.0, 1.0]);
        let huge_shape = TensorRef {
            storage: storage_ref(2),
            offset: 0,
            shape: vec![usize::MAX, 2],
            stride: vec![2, 1],
        };
        assert!(matches!(
            materialize(&huge_shape, &storage),
            Err(CheckpointError::SizeOverflow { .. })
        ));

        let huge_stride = TensorRef {
            storage: storage_ref(2),
            offset: 0,
            shape: vec![2],
            stride: vec![usize::MAX],
        };
        assert!(matches!(
            materialize(&huge_stride, &storage),
            Err(CheckpointError::SizeOverflow { .. })
        ));

        let huge_offset = TensorRef {
            storage: storage_ref(2),
            offset: usize::MAX,
            shape: vec![1],
            stride: vec![1],
        };
        assert!(materialize(&huge_offset, &storage).is_err());
    }

    #[test]
    fn test_state_dict_shared_with_model_entry() {
        // {'model': sd, 'state_dict': sd} where sd is memoized before it is filled
        let tensor = Tensor::from_f32(vec![1], &[9.0]).unwrap();
        let mut pkl = vec![OpCode::Proto as u8, 2, OpCode::EmptyDict as u8, OpCode::Mark as u8];
        pkl.extend(ops(|p| p.unicode("model")));
        pkl.extend([OpCode::EmptyDict as u8, OpCode::BinPut as u8, 1, OpCode::Mark as u8]);
        pkl.extend(ops(|p| {
            p.unicode("model.diffusion_model.a");
            p.tensor(&tensor, "0").unwrap();
        }));
        pkl.push(OpCode::SetItems as u8);
        pkl.extend(ops(|p| p.unicode(STATE_DICT_KEY)));
        pkl.extend([OpCode::BinGet as u8, 1, OpCode::SetItems as u8, OpCode::Stop as u8]);

        let bytes = zip_bytes(&[("archive/data.pkl", &pkl), ("archive/data/0", tensor.data())]);
        let loaded = load_bytes(&bytes).unwrap();
        assert!(loaded.is_nested());
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get("model.diffusion_model.a"), Some(&tensor));
    }

    #[test]
    fn test_parameter_with_state_is_loaded() {
        // {'model.diffusion_model.a': _rebuild_parameter_with_state(t, False, OrderedDict(), {})}
        let tensor = Tensor::from_f32(vec![2], &[1.0, 2.0]).unwrap();
        let mut pkl = vec![OpCode::Proto as u8, 2, OpCode::EmptyDict as u8];
        pkl.extend(ops(|p| {
            p.unicode("model.diffusion_model.a");
            p.global("torch._utils", "_rebuild_parameter_with_state");
            p.mark();
            p.tensor(&tensor, "0").unwrap();
        }));
        pkl.push(OpCode::NewFalse as u8);
        pkl.extend(ops(|p| {
            p.global("collections", "OrderedDict");
            p.usize_tuple(&[]);
            p.reduce();
            p.empty_dict();
        }));
        pkl.extend([
            OpCode::Tuple as u8,
            OpCode::Reduce as u8,
            OpCode::SetItem as u8,
            OpCode::Stop as u8,
        ]);

        let bytes = zip_bytes(&[("archive/data.pkl", &pkl), ("archive/data/0", tensor.data())]);
        let loaded = load_bytes(&bytes).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get("model.diffusion_model.a"), Some(&tensor));
    }

    #[test]
    fn test_placeholders_are_skipped() {
        // {'state_dict': {'a': <tensor>}, 'callbacks': ModelCheckpoint(), 'epoch': 3}
        let tensor = Tensor::from_f32(vec![1], &[9.0]).unwrap();
        let mut p = Pickler::new();
        p.empty_dict();
        p.mark();
        p.unicode("callbacks");
        p.global("pytorch_lightning.callbacks", "ModelCheckpoint");
        p.usize_tuple(&[]);
        p.reduce();
        p.unicode("epoch");
        p.int(3);
        p.unicode(STATE_DICT_KEY);
        p.empty_dict();
        p.unicode("model.diffusion_model.a");
        p.tensor(&tensor, "0").unwrap();
        p.set_item();
        p.set_items();
        let pkl = p.finish();

        let bytes = zip_bytes(&[("ckpt/data.pkl", &pkl), ("ckpt/data/0", tensor.data())]);
        let loaded = load_bytes(&bytes).unwrap();
        assert!(loaded.is_nested());
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get("model.diffusion_model.a"), Some(&tensor));
    }

    #[test]
    fn test_missing_storage_entry() {
        let tensor = Tensor::from_f32(vec![1], &[9.0]).unwrap();
        let mut p = Pickler::new();
        p.empty_dict();
        p.unicode("w");
        p.tensor(&tensor, "0").unwrap();
        p.set_item();
        let pkl = p.finish();

        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = ZipWriter::new(&mut buf);
            zip.start_file("archive/data.pkl", SimpleFileOptions::default()).unwrap();
            zip.write_all(&pkl).unwrap();
            zip.finish().unwrap();
        }
        assert!(matches!(
            load_bytes(buf.get_ref()),
            Err(CheckpointError::MissingStorage { .. })
        ));
    }

    #[test]
    fn test_legacy_layout() {
        let tensor = Tensor::from_f32(vec![2], &[1.5, -2.5]).unwrap();
        let mut stream = legacy_header();

        let mut p = Pickler::new();
        p.empty_dict();
        p.unicode("model.diffusion_model.w");
        p.tensor(&tensor, "140").unwrap();
        p.set_item();
        stream.extend(p.finish());

        let mut p = Pickler::new();
        p.mark();
        p.unicode("140");
        p.list();
        stream.extend(p.finish());

        stream.extend_from_slice(&2u64.to_le_bytes());
        stream.extend_from_slice(tensor.data());

        let loaded = load_legacy(Cursor::new(stream)).unwrap();
        assert!(!loaded.is_nested());
        assert_eq!(loaded.get("model.diffusion_model.w"), Some(&tensor));
    }

    fn legacy_header() -> Vec<u8> {
        let mut stream = Vec::new();
        let mut p = Pickler::new();
        p.long1(&LEGACY_MAGIC);
        stream.extend(p.finish());
        let mut p = Pickler::new();
        p.int(LEGACY_PROTOCOL_VERSION);
        stream.extend(p.finish());
        let mut p = Pickler::new();
        p.empty_dict();
        stream.extend(p.finish());
        stream
    }

    #[test]
    fn test_legacy_storage_view() {
        // tensor over the second half of a 4-element root storage, referenced
        // through the view tuple ('141', 2, 2)
        let mut stream = legacy_header();

        let mut pkl = vec![OpCode::Proto as u8, 2, OpCode::EmptyDict as u8];
        pkl.extend(ops(|p| {
            p.unicode("model.diffusion_model.w");
            p.global("torch._utils", "_rebuild_tensor_v2");
            p.mark();
            p.mark();
            p.unicode("storage");
            p.global("torch", "FloatStorage");
            p.unicode("140");
            p.unicode("cpu");
            p.int(4);
            p.mark();
            p.unicode("141");
            p.int(2);
            p.int(2);
        }));
        pkl.extend([OpCode::Tuple as u8, OpCode::Tuple as u8, OpCode::BinPersId as u8]);
        pkl.extend(ops(|p| {
            p.int(0);
            p.usize_tuple(&[2]);
            p.usize_tuple(&[1]);
        }));
        pkl.push(OpCode::NewFalse as u8);
        pkl.extend(ops(|p| {
            p.global("collections", "OrderedDict");
            p.usize_tuple(&[]);
            p.reduce();
        }));
        pkl.extend([
            OpCode::Tuple as u8,
            OpCode::Reduce as u8,
            OpCode::SetItem as u8,
            OpCode::Stop as u8,
        ]);
        stream.extend(pkl);

        let mut p = Pickler::new();
        p.mark();
        p.unicode("140");
        p.list();
        stream.extend(p.finish());

        stream.extend_from_slice(&4u64.to_le_bytes());
        stream.extend(f32_bytes(&[1.0, 2.0, 3.0, 4.0]));

        let loaded = load_legacy(Cursor::new(stream)).unwrap();
        assert_eq!(
            loaded.get("model.diffusion_model.w"),
            Some(&Tensor::from_f32(vec![2], &[3.0, 4.0]).unwrap())
        );
    }

    #[test]
    fn test_legacy_truncated_storage() {
        let tensor = Tensor::from_f32(vec![2], &[1.5, -2.5]).unwrap();
        let mut stream = legacy_header();
        let mut p = Pickler::new();
        p.empty_dict();
        p.unicode("w");
        p.tensor(&tensor, "140").unwrap();
        p.set_item();
        stream.extend(p.finish());
        let mut p = Pickler::new();
        p.mark();
        p.unicode("140");
        p.list();
        stream.extend(p.finish());

        // claims far more elements than follow
        stream.extend_from_slice(&u64::MAX.to_le_bytes());
        stream.extend_from_slice(tensor.data());
        assert!(load_legacy(Cursor::new(stream)).is_err());
    }
}
