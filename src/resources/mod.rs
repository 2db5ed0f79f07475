mod organization;
mod project;
mod result_file;
mod result_folder;
mod sample;

pub use organization::Organization;
pub use project::Project;
pub use result_file::{DownloadOptions, ResultFile};
pub use result_folder::{FolderParent, ResultFolder};
pub use sample::Sample;
