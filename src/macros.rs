#![allow(unused_macros)]

/// Helper macro for locking a mutex inside a function returning [`crate::Result`]
///
/// ```rust, ignore
///  let mut registry = lock!(self.registry);
///  registry.functions.clear();
/// ```
macro_rules! lock {
    ($lock:expr) => {
        $lock.lock().map_err(|_| crate::Error::LockError)?
    };
}

/// Helper macro for read-locking an `RwLock` inside a function returning [`crate::Result`]
///
/// ```rust, ignore
///  let memory = read_lock!(self.memory);
///  buf.copy_from_slice(&memory[start..end]);
/// ```
macro_rules! read_lock {
    ($rwlock:expr) => {
        $rwlock.read().map_err(|_| crate::Error::LockError)?
    };
}

/// Helper macro for write-locking an `RwLock` inside a function returning [`crate::Result`]
///
/// ```rust, ignore
///  let mut memory = write_lock!(self.memory);
///  memory[start..end].copy_from_slice(bytes);
/// ```
macro_rules! write_lock {
    ($rwlock:expr) => {
        $rwlock.write().map_err(|_| crate::Error::LockError)?
    };
}
