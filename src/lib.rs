pub mod mcsw;
