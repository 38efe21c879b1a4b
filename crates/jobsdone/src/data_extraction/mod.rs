/// Module for extracting data using the `sacct` command
pub mod sacct;

#[cfg(feature = "ssh")]
pub use sacct::get_sacct_res_ssh;
pub use sacct::{
    get_sacct_res, get_sacct_res_locally, parse_sacct_output, sacct_diff, SacctQuery, SacctRow,
    SacctWindow,
};
