use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{read_dir, read_to_string};

use dns_types::zones::types::Zone;

/// Read a zone file.  The file must contain exactly one SOA record,
/// whose owner becomes the zone apex, and all other RRs must be
/// subdomains of it.
pub async fn zone_from_file<P: AsRef<Path>>(
    path: P,
) -> io::Result<Result<Zone, dns_types::zones::deserialise::Error>> {
    let data = read_to_string(path).await?;
    Ok(Zone::deserialise(&data))
}

/// Get files from a directory, sorted.
pub async fn get_files_from_dir(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();

    let mut reader = read_dir(dir).await?;
    while let Some(entry) = reader.next_entry().await? {
        let path = entry.path();
        if !path.is_dir() {
            out.push(path);
        }
    }

    out.sort();
    Ok(out)
}
