pub(crate) mod fatal;
pub(crate) mod manager;
pub(crate) mod os;
pub(crate) mod size_class;
pub(crate) mod stats;
pub(crate) mod token_pool;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
