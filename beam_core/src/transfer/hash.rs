use blake3::Hasher;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::constants::CHUNK_SIZE;

/// Compute BLAKE3 hash of a file as lowercase hex
pub async fn compute_file_hash(file_path: &Path) -> std::io::Result<String> {
    let mut file = File::open(file_path).await?;
    let mut hasher = Hasher::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}
