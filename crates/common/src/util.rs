//! Assorted utility functions and structures.
//!
//! This module contains various utility functions and structures
//! that are used throughout the core's codebase.

use std::{
    cell::RefCell,
    fs::File,
    io::{Read, Write},
    path::Path,
    rc::Rc,
    sync::{Arc, Mutex},
    time::Instant,
};

use crate::error::Error;

/// Shared mutable type able to be passed between types
/// allowing for circular referencing and interior mutability.
pub type SharedMut<T> = Rc<RefCell<T>>;

/// Shared thread type able to be passed between threads.
///
/// Significant performance overhead compared to `SharedMut`.
pub type SharedThread<T> = Arc<Mutex<T>>;

/// Reads the contents of the file at the given path into
/// a vector of bytes.
pub fn read_file(path: &str) -> Result<Vec<u8>, Error> {
    let mut file = File::open(path).map_err(|err| Error::Io(format!("{path}: {err}")))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .map_err(|err| Error::Io(format!("{path}: {err}")))?;
    Ok(data)
}

/// Writes the given data to the file at the given path.
pub fn write_file(path: &str, data: &[u8], flush: Option<bool>) -> Result<(), Error> {
    let mut file = File::create(path).map_err(|err| Error::Io(format!("{path}: {err}")))?;
    file.write_all(data)
        .map_err(|err| Error::Io(format!("{path}: {err}")))?;
    if flush.unwrap_or(true) {
        file.flush()
            .map_err(|err| Error::Io(format!("{path}: {err}")))?;
    }
    Ok(())
}

/// Replaces the extension in the given path with the provided extension.
///
/// This function allows for simple associated file discovery, namely
/// for locating a cartridge's battery-RAM file next to its ROM file.
pub fn replace_ext(path: &str, new_extension: &str) -> Option<String> {
    let file_path = Path::new(path);
    let parent_dir = file_path.parent()?;
    let file_stem = file_path.file_stem()?;
    let file_extension = file_path.extension()?;
    if file_stem == file_extension {
        return None;
    }
    let new_file_name = format!("{}.{}", file_stem.to_str()?, new_extension);
    let new_file_path = parent_dir.join(new_file_name);
    Some(String::from(new_file_path.to_str()?))
}

/// Capitalizes the first character in the provided string.
pub fn capitalize(string: &str) -> String {
    let mut chars = string.chars();
    match chars.next() {
        None => String::new(),
        Some(chr) => chr.to_uppercase().collect::<String>() + chars.as_str(),
    }
}

/// A monotonic instant, suitable as an anchor for elapsed-time
/// computations that must never run backwards (e.g. the MBC3 RTC).
///
/// Kept as a thin wrapper so call sites never reach for
/// [`std::time::SystemTime`] directly for this purpose.
pub fn monotonic_now() -> Instant {
    Instant::now()
}

/// Seconds elapsed between an `anchor` previously obtained from
/// [`monotonic_now`] and the current instant. Saturates at zero,
/// since a monotonic clock cannot move backwards relative to itself.
pub fn elapsed_secs(anchor: Instant) -> u64 {
    Instant::now().saturating_duration_since(anchor).as_secs()
}

#[cfg(test)]
mod tests {
    use std::{path::Path, thread::sleep, time::Duration};

    use super::{capitalize, elapsed_secs, monotonic_now, replace_ext};

    #[test]
    fn test_change_extension() {
        let new_path = replace_ext("/path/to/file.txt", "dat").unwrap();
        assert_eq!(
            new_path,
            Path::new("/path/to").join("file.dat").to_str().unwrap()
        );

        let new_path = replace_ext("/path/to/file.with.multiple.dots.txt", "dat").unwrap();
        assert_eq!(
            new_path,
            Path::new("/path/to")
                .join("file.with.multiple.dots.dat")
                .to_str()
                .unwrap()
        );

        let new_path = replace_ext("/path/to/file.without.extension", "dat").unwrap();
        assert_eq!(
            new_path,
            Path::new("/path/to")
                .join("file.without.dat")
                .to_str()
                .unwrap()
        );

        let new_path = replace_ext("/path/to/directory/", "dat");
        assert_eq!(new_path, None);
    }

    #[test]
    fn test_capitalize_empty_string() {
        let result = capitalize("");
        assert_eq!(result, "");
    }

    #[test]
    fn test_capitalize_single_character() {
        let result = capitalize("a");
        assert_eq!(result, "A");
    }

    #[test]
    fn test_capitalize_multiple_characters() {
        let result = capitalize("hello, world!");
        assert_eq!(result, "Hello, world!");
    }

    #[test]
    fn test_elapsed_secs_non_negative() {
        let anchor = monotonic_now();
        sleep(Duration::from_millis(10));
        // a sub-second sleep should not yet register a full second,
        // but the call must never panic or underflow
        assert!(elapsed_secs(anchor) < 2);
    }
}
