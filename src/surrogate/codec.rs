//! Binary (de)serialization of granule sets for the on-disk granule cache.
//!
//! Layout: magic, version, granule count, compression flag, then a gzip
//! payload of `{weight: f64, ncells: u32, cells: u64...}` records, all
//! little-endian. Only the flat granule list is encoded; decoding rebuilds
//! the spatial index from it.

use anyhow::{bail, Context, Result};
use bytes::{Buf, BufMut, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use super::{Granule, SrgData};
use crate::sph::{CellId, CellUnion};

/// Magic bytes of the granule cache format.
const MAGIC: &[u8] = b"SRGD";
/// Format version (currently 1).
const VERSION: u8 = 1;

impl SrgData {
    /// Encode the flat granule list.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut payload = BytesMut::new();
        for g in self.granules() {
            payload.put_f64_le(g.weight());
            payload.put_u32_le(g.footprint().len() as u32);
            for cell in g.footprint().cells() {
                payload.put_u64_le(cell.0);
            }
        }

        let mut out = Vec::new();
        out.write_all(MAGIC).context("granule cache: writing magic")?;
        out.write_all(&[VERSION]).context("granule cache: writing version")?;
        out.write_all(&(self.len() as u32).to_le_bytes())
            .context("granule cache: writing granule count")?;
        let mut encoder = GzEncoder::new(out, Compression::default());
        encoder.write_all(&payload).context("granule cache: compressing payload")?;
        encoder.finish().context("granule cache: finishing compression")
    }

    /// Decode a granule list and rebuild the spatial index over it.
    pub fn from_bytes(data: &[u8]) -> Result<SrgData> {
        if data.len() < MAGIC.len() + 5 || &data[..MAGIC.len()] != MAGIC {
            bail!("granule cache: bad magic bytes");
        }
        let version = data[MAGIC.len()];
        if version != VERSION {
            bail!("granule cache: unsupported version {version}");
        }
        let count =
            u32::from_le_bytes(data[MAGIC.len() + 1..MAGIC.len() + 5].try_into().unwrap()) as usize;

        let mut payload = Vec::new();
        GzDecoder::new(&data[MAGIC.len() + 5..])
            .read_to_end(&mut payload)
            .context("granule cache: decompressing payload")?;

        let mut buf = payload.as_slice();
        let mut granules = Vec::with_capacity(count);
        for i in 0..count {
            if buf.remaining() < 12 {
                bail!("granule cache: truncated at granule {i}");
            }
            let weight = buf.get_f64_le();
            let ncells = buf.get_u32_le() as usize;
            if buf.remaining() < ncells * 8 {
                bail!("granule cache: truncated footprint at granule {i}");
            }
            let cells = (0..ncells).map(|_| CellId(buf.get_u64_le())).collect();
            granules.push(Granule::new(weight, CellUnion::new(cells)));
        }
        if buf.has_remaining() {
            bail!("granule cache: {} trailing bytes", buf.remaining());
        }
        Ok(SrgData::new(granules))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sph::Coverer;
    use crate::surrogate::SurrogateRow;
    use ahash::AHashMap;
    use geo::{polygon, MultiPolygon, Rect};

    fn sample_data() -> SrgData {
        let rows: Vec<SurrogateRow> = (0..4)
            .map(|i| {
                let x0 = i as f64 * 2.0;
                SurrogateRow {
                    weight: (i + 1) as f64 * 100.0,
                    shape: MultiPolygon::new(vec![polygon![
                        (x: x0, y: 0.0), (x: x0 + 1.5, y: 0.0),
                        (x: x0 + 1.5, y: 1.5), (x: x0, y: 1.5), (x: x0, y: 0.0),
                    ]]),
                    attrs: AHashMap::new(),
                }
            })
            .collect();
        SrgData::from_rows(&rows, None, Coverer::new(9))
    }

    #[test]
    fn roundtrip_preserves_granules_and_index() {
        let data = sample_data();
        let bytes = data.to_bytes().unwrap();
        let decoded = SrgData::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.len(), data.len());
        for (a, b) in data.granules().iter().zip(decoded.granules()) {
            assert_eq!(a.weight(), b.weight());
            assert_eq!(a.footprint(), b.footprint());
        }
        // The rebuilt index answers the same queries.
        let q = Rect::new((0.0, 0.0), (3.0, 1.0));
        assert_eq!(data.granules_overlapping(&q), decoded.granules_overlapping(&q));
    }

    #[test]
    fn roundtrip_through_disk() {
        let data = sample_data();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("granules.srgd");
        std::fs::write(&path, data.to_bytes().unwrap()).unwrap();
        let decoded = SrgData::from_bytes(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(decoded.len(), data.len());
    }

    #[test]
    fn bad_magic_is_rejected() {
        assert!(SrgData::from_bytes(b"NOPE\x01\x00\x00\x00\x00").is_err());
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut bytes = sample_data().to_bytes().unwrap();
        bytes[4] = 99;
        assert!(SrgData::from_bytes(&bytes).is_err());
    }

    #[test]
    fn empty_dataset_roundtrips() {
        let data = SrgData::new(Vec::new());
        let decoded = SrgData::from_bytes(&data.to_bytes().unwrap()).unwrap();
        assert!(decoded.is_empty());
    }
}
