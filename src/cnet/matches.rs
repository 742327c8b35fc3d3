//! Binary interest-point match files.
//!
//! A match file stores two equally long lists of interest points, one per
//! image of a pair, under `<prefix>-<imgA>__<imgB>.match`. The on-disk
//! layout is little-endian: `u64 n`, then `n` left records followed by `n`
//! right records of `f64 x, f64 y, f64 sx, f64 sy`. Reads go through a
//! memory map since outlier rejection re-reads every pair file each pass.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{AdjustError, AdjustResult};

/// An interest point: pixel location and per-axis sigma.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ip {
    pub x: f64,
    pub y: f64,
    pub sx: f64,
    pub sy: f64,
}

impl Ip {
    pub fn new(x: f64, y: f64) -> Self {
        Ip {
            x,
            y,
            sx: 1.0,
            sy: 1.0,
        }
    }
}

/// Match filename convention: `<prefix>-<stemA>__<stemB>.match`.
pub fn match_filename(prefix: &str, image1: &Path, image2: &Path) -> PathBuf {
    let stem = |p: &Path| {
        p.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    PathBuf::from(format!(
        "{prefix}-{}__{}.match",
        stem(image1),
        stem(image2)
    ))
}

const RECORD_LEN: usize = 32;

/// Read a binary match file into (left, right) interest-point lists.
pub fn read_match_file<P: AsRef<Path>>(path: P) -> AdjustResult<(Vec<Ip>, Vec<Ip>)> {
    let file = File::open(&path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    let buf: &[u8] = &mmap;
    if buf.len() < 8 {
        return Err(AdjustError::Io(format!(
            "Match file too short: {}",
            path.as_ref().display()
        )));
    }
    let n = u64::from_le_bytes(buf[0..8].try_into().unwrap()) as usize;
    if buf.len() != 8 + 2 * n * RECORD_LEN {
        return Err(AdjustError::Io(format!(
            "Match file size mismatch ({} ips): {}",
            n,
            path.as_ref().display()
        )));
    }

    let parse = |off: usize| {
        let g = |k: usize| f64::from_le_bytes(buf[off + 8 * k..off + 8 * (k + 1)].try_into().unwrap());
        Ip {
            x: g(0),
            y: g(1),
            sx: g(2),
            sy: g(3),
        }
    };
    let left = (0..n).map(|i| parse(8 + i * RECORD_LEN)).collect();
    let right = (0..n)
        .map(|i| parse(8 + (n + i) * RECORD_LEN))
        .collect();
    Ok((left, right))
}

/// Write a binary match file from (left, right) interest-point lists.
pub fn write_match_file<P: AsRef<Path>>(path: P, left: &[Ip], right: &[Ip]) -> AdjustResult<()> {
    if left.len() != right.len() {
        return Err(AdjustError::Logic(format!(
            "Match lists differ in length: {} vs {}",
            left.len(),
            right.len()
        )));
    }
    let mut out = BufWriter::new(File::create(&path)?);
    out.write_all(&(left.len() as u64).to_le_bytes())?;
    for ip in left.iter().chain(right.iter()) {
        out.write_all(&ip.x.to_le_bytes())?;
        out.write_all(&ip.y.to_le_bytes())?;
        out.write_all(&ip.sx.to_le_bytes())?;
        out.write_all(&ip.sy.to_le_bytes())?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_filename() {
        let name = match_filename(
            "run/out",
            Path::new("data/left.tif"),
            Path::new("data/right.tif"),
        );
        assert_eq!(name, PathBuf::from("run/out-left__right.match"));
    }

    #[test]
    fn test_match_file_round_trip() {
        let left = vec![Ip::new(1.5, 2.5), Ip::new(100.0, 200.0)];
        let right = vec![
            Ip {
                x: 3.0,
                y: 4.0,
                sx: 0.5,
                sy: 0.7,
            },
            Ip::new(110.0, 190.0),
        ];
        let dir = std::env::temp_dir().join("apogee_match_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("pair.match");
        write_match_file(&path, &left, &right).unwrap();
        let (l, r) = read_match_file(&path).unwrap();
        assert_eq!(l, left);
        assert_eq!(r, right);
    }

    #[test]
    fn test_mismatched_lengths_rejected() {
        let dir = std::env::temp_dir().join("apogee_match_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.match");
        let err = write_match_file(&path, &[Ip::new(0.0, 0.0)], &[]);
        assert!(err.is_err());
    }
}
