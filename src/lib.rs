extern crate bitmaps;
extern crate indexmap;
extern crate itertools;
extern crate log;
extern crate serde_json;
extern crate thiserror;

pub mod driver;
pub mod dump;
pub mod heap;
pub mod image;
pub mod load;
