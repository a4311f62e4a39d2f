//! Streaming content hashes for manifest file provenance.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// SHA-256 of a file's content, hex encoded. Reads in fixed-size blocks
/// so large tool outputs do not land in memory at once.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_sha256_file_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netlist.v");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "module top(); endmodule").unwrap();
        drop(f);

        let first = sha256_file(&path).unwrap();
        let second = sha256_file(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }
}
