//! NPY file reading and writing
//!
//! Batches dumped by the Python training tooling are plain NumPy `.npy`
//! files; the debug driver writes the same format back so both sides can
//! be diffed.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

const MAGIC: &[u8; 6] = b"\x93NUMPY";

/// NPY array data
#[derive(Debug, Clone)]
pub struct NpyArray {
    /// Shape of the array
    pub shape: Vec<usize>,
    /// Data type string (e.g., "<f4", "<i8")
    pub dtype: String,
    /// Raw data bytes, little-endian, C order
    pub data: Vec<u8>,
}

impl NpyArray {
    /// Get total number of elements
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get as f32 vector (assumes float32 dtype)
    pub fn as_f32(&self) -> Result<Vec<f32>> {
        if !self.dtype.contains("f4") && !self.dtype.contains("float32") {
            anyhow::bail!("Expected float32, got {}", self.dtype);
        }

        let floats: Vec<f32> = self
            .data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        Ok(floats)
    }

    /// Get as i64 vector (assumes int64 dtype)
    pub fn as_i64(&self) -> Result<Vec<i64>> {
        if !self.dtype.contains("i8") && !self.dtype.contains("int64") {
            anyhow::bail!("Expected int64, got {}", self.dtype);
        }

        let ints: Vec<i64> = self
            .data
            .chunks_exact(8)
            .map(|b| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            .collect();

        Ok(ints)
    }

    /// Get as i32 vector (assumes int32 dtype)
    pub fn as_i32(&self) -> Result<Vec<i32>> {
        if !self.dtype.contains("i4") && !self.dtype.contains("int32") {
            anyhow::bail!("Expected int32, got {}", self.dtype);
        }

        let ints: Vec<i32> = self
            .data
            .chunks_exact(4)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        Ok(ints)
    }

    /// Convert to a tensor
    ///
    /// Candle has no 32/16-bit signed integer dtype, so `i4` and `i2`
    /// arrays become `I64` tensors.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let shape = self.shape.as_slice();
        let code = dtype_code(&self.dtype)?;
        let tensor = match code {
            "f4" => Tensor::from_vec(self.as_f32()?, shape, device)?,
            "f8" => {
                let v: Vec<f64> = self
                    .data
                    .chunks_exact(8)
                    .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                    .collect();
                Tensor::from_vec(v, shape, device)?
            }
            "i8" => Tensor::from_vec(self.as_i64()?, shape, device)?,
            "i4" => {
                let v: Vec<i64> = self.as_i32()?.into_iter().map(i64::from).collect();
                Tensor::from_vec(v, shape, device)?
            }
            "i2" => {
                let v: Vec<i64> = self
                    .data
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]) as i64)
                    .collect();
                Tensor::from_vec(v, shape, device)?
            }
            "u4" => {
                let v: Vec<u32> = self
                    .data
                    .chunks_exact(4)
                    .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect();
                Tensor::from_vec(v, shape, device)?
            }
            "u1" => Tensor::from_vec(self.data.clone(), shape, device)?,
            other => anyhow::bail!("Unsupported dtype: {}", other),
        };
        Ok(tensor)
    }
}

/// Strip the byte-order character: "<f4" -> "f4"
fn dtype_code(dtype: &str) -> Result<&str> {
    if dtype.starts_with('>') {
        anyhow::bail!("Big-endian arrays are not supported: {}", dtype);
    }
    Ok(dtype.trim_start_matches(['<', '|', '=']))
}

fn element_size(dtype: &str) -> Result<usize> {
    let size = match dtype_code(dtype)? {
        "f4" | "i4" | "u4" => 4,
        "f8" | "i8" => 8,
        "i2" => 2,
        "u1" => 1,
        other => anyhow::bail!("Unsupported dtype: {}", other),
    };
    Ok(size)
}

/// Load an NPY file
pub fn load_npy<P: AsRef<Path>>(path: P) -> Result<NpyArray> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Failed to open NPY file: {:?}", path))?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    // Read magic number (6 bytes: \x93NUMPY)
    let mut magic = [0u8; 6];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        anyhow::bail!("Invalid NPY magic number in {:?}", path);
    }

    // Read version (2 bytes)
    let mut version = [0u8; 2];
    reader.read_exact(&mut version)?;
    let major = version[0];

    // Read header length
    let (header_len, prefix_len) = if major == 1 {
        let mut len_bytes = [0u8; 2];
        reader.read_exact(&mut len_bytes)?;
        (u16::from_le_bytes(len_bytes) as u64, 10)
    } else {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        (u32::from_le_bytes(len_bytes) as u64, 12)
    };
    let payload_len = file_len
        .checked_sub(prefix_len + header_len)
        .with_context(|| format!("Truncated NPY header in {:?}", path))?;
    let header_len = header_len as usize;

    // Read header
    let mut header_bytes = vec![0u8; header_len];
    reader.read_exact(&mut header_bytes)?;
    let header = String::from_utf8_lossy(&header_bytes);

    if header.contains("'fortran_order': True") {
        anyhow::bail!("Fortran-ordered arrays are not supported: {:?}", path);
    }
    let dtype = parse_dtype(&header)?;
    let shape = parse_shape(&header)?;

    let data_size = shape
        .iter()
        .try_fold(element_size(&dtype)?, |acc, &d| acc.checked_mul(d))
        .with_context(|| format!("NPY shape {:?} overflows in {:?}", shape, path))?;
    anyhow::ensure!(
        data_size as u64 <= payload_len,
        "Truncated NPY payload in {:?}: shape {:?} of {} needs {} bytes, file has {}",
        path,
        shape,
        dtype,
        data_size,
        payload_len
    );

    let mut data = vec![0u8; data_size];
    reader
        .read_exact(&mut data)
        .with_context(|| format!("Truncated NPY payload in {:?}", path))?;

    Ok(NpyArray { shape, dtype, data })
}

/// Load NPY file as f32 vector
pub fn load_npy_f32<P: AsRef<Path>>(path: P) -> Result<(Vec<f32>, Vec<usize>)> {
    let arr = load_npy(path)?;
    let data = arr.as_f32()?;
    Ok((data, arr.shape))
}

/// Load NPY file straight into a tensor
pub fn load_npy_tensor<P: AsRef<Path>>(path: P, device: &Device) -> Result<Tensor> {
    load_npy(path)?.to_tensor(device)
}

/// Write a tensor as an NPY file
pub fn save_npy_tensor<P: AsRef<Path>>(path: P, tensor: &Tensor) -> Result<()> {
    let path = path.as_ref();
    tensor
        .write_npy(path)
        .with_context(|| format!("Failed to write NPY file: {:?}", path))
}

/// Parse dtype from NPY header
fn parse_dtype(header: &str) -> Result<String> {
    // Look for 'descr': '<f4' or similar
    let start = header
        .find("'descr'")
        .or_else(|| header.find("\"descr\""))
        .ok_or_else(|| anyhow::anyhow!("No descr in header"))?;

    let rest = &header[start + "'descr'".len()..];
    let colon = rest.find(':').ok_or_else(|| anyhow::anyhow!("No colon after descr"))?;
    let after_colon = &rest[colon + 1..];

    // Find the dtype string
    let quote_start = after_colon
        .find(['\'', '"'])
        .ok_or_else(|| anyhow::anyhow!("No dtype string"))?;
    let quote_char = &after_colon[quote_start..quote_start + 1];
    let dtype_start = quote_start + 1;
    let dtype_end = after_colon[dtype_start..]
        .find(quote_char)
        .ok_or_else(|| anyhow::anyhow!("Unclosed dtype string"))?;

    Ok(after_colon[dtype_start..dtype_start + dtype_end].to_string())
}

/// Parse shape from NPY header
fn parse_shape(header: &str) -> Result<Vec<usize>> {
    // Look for 'shape': (1, 2, 3) or similar
    let start = header
        .find("'shape'")
        .or_else(|| header.find("\"shape\""))
        .ok_or_else(|| anyhow::anyhow!("No shape in header"))?;

    let rest = &header[start..];
    let paren_start = rest.find('(').ok_or_else(|| anyhow::anyhow!("No shape tuple"))?;
    let paren_end = rest.find(')').ok_or_else(|| anyhow::anyhow!("Unclosed shape tuple"))?;

    rest[paren_start + 1..paren_end]
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.trim()
                .parse::<usize>()
                .map_err(|e| anyhow::anyhow!("Invalid shape element: {}", e))
        })
        .collect()
}
