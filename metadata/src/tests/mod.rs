mod method_desc_tests;

pub(crate) use crate::testing::Scratch;

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
