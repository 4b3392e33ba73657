pub mod bm;
