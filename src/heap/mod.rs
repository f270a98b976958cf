pub(crate) mod bins;
pub(crate) mod chunk;
pub(crate) mod general;
pub(crate) mod hooks;
pub(crate) mod state;
pub(crate) mod stats;
pub(crate) mod validate;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
