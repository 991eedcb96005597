//! Host capacity probes.

use std::path::Path;

use burrow_shared::{BurrowError, BurrowResult};
use nix::sys::statvfs::statvfs;
use nix::sys::sysinfo::sysinfo;

/// Total physical memory in bytes.
pub fn total_memory() -> BurrowResult<u64> {
    let info = sysinfo().map_err(io_error)?;
    Ok(info.ram_total())
}

/// Size in bytes of the filesystem holding `path`.
pub fn disk_size(path: &Path) -> BurrowResult<u64> {
    let stat = statvfs(path).map_err(io_error)?;
    Ok(stat.blocks() as u64 * stat.fragment_size() as u64)
}

fn io_error(errno: nix::errno::Errno) -> BurrowError {
    BurrowError::Io(std::io::Error::from_raw_os_error(errno as i32))
}
