use crate::error::{PhantomError, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// 原子地重写文件：写临时文件 -> sync -> rename
///
/// 返回前数据已经落盘，读到的要么是旧内容要么是新内容。
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = temp_path(path);
    let result = write_synced(&tmp, contents).and_then(|_| std::fs::rename(&tmp, path));

    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(PhantomError::persist(path, e));
    }

    // rename 之后同步目录项（仅 unix 有意义）
    #[cfg(unix)]
    if let Some(dir) = path.parent() {
        if let Ok(d) = File::open(dir) {
            let _ = d.sync_all();
        }
    }

    Ok(())
}

fn write_synced(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
