//! Test support for exercising the SDO client engine end-to-end

pub mod sim_server;
