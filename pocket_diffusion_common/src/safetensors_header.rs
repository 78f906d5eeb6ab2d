use std::{fs::File, path::Path};

use memmap2::Mmap;
use safetensors::SafeTensors;

use crate::Result;

/// What a safetensors header says about a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetensorsSummary {
    pub tensor_count: usize,
    pub data_bytes: usize,
}

/// Map the file and validate its header without copying tensor data.
pub fn inspect_safetensors(path: &Path) -> Result<SafetensorsSummary> {
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    let st = SafeTensors::deserialize(&mmap)?;
    let data_bytes = st.tensors().iter().map(|(_, view)| view.data().len()).sum();
    Ok(SafetensorsSummary {
        tensor_count: st.len(),
        data_bytes,
    })
}
