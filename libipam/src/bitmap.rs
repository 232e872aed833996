use serde::{Deserialize, Serialize};

/// Fixed-length allocation bitmap, one bit per allocatable slot.
///
/// Persisted as `{"len": n, "bits": "<hex>"}` so a /16 pool stays a few
/// kilobytes on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBitmap", into = "RawBitmap")]
pub struct Bitmap {
    len: usize,
    bits: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct RawBitmap {
    len: usize,
    bits: String,
}

impl Bitmap {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            bits: vec![0; len.div_ceil(8)],
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Out-of-range indices read as free.
    pub fn get(&self, index: usize) -> bool {
        index < self.len && self.bits[index / 8] & (1 << (index % 8)) != 0
    }

    pub fn set(&mut self, index: usize) {
        if index < self.len {
            self.bits[index / 8] |= 1 << (index % 8);
        }
    }

    pub fn clear(&mut self, index: usize) {
        if index < self.len {
            self.bits[index / 8] &= !(1 << (index % 8));
        }
    }

    pub fn count_ones(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }
}

impl TryFrom<RawBitmap> for Bitmap {
    type Error = String;

    fn try_from(raw: RawBitmap) -> Result<Self, Self::Error> {
        let bits = hex::decode(&raw.bits).map_err(|e| format!("bitmap is not hex: {e}"))?;
        if bits.len() != raw.len.div_ceil(8) {
            return Err(format!(
                "bitmap holds {} bytes, expected {} for {} slots",
                bits.len(),
                raw.len.div_ceil(8),
                raw.len
            ));
        }
        let tail = raw.len % 8;
        if tail != 0 && bits.last().is_some_and(|b| b >> tail != 0) {
            return Err("bitmap has bits set past its length".to_string());
        }
        Ok(Self { len: raw.len, bits })
    }
}

impl From<Bitmap> for RawBitmap {
    fn from(bitmap: Bitmap) -> Self {
        RawBitmap {
            len: bitmap.len,
            bits: hex::encode(bitmap.bits),
        }
    }
}
