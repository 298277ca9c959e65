//! The meta page.
//!
//! Block 0 carries a magic word and the array-state matrix. Rewriting the
//! matrix is the engine's checkpoint primitive: every insert or merge state
//! transition becomes visible to other backends the moment the matrix lands
//! on this page.

use bytemuck::{Pod, Zeroable};
use cola_store::{
    BlockNumber, BufferPool, PAGE_HEADER_SIZE, PAGE_TRAILER_SIZE, PageBuf, PageFlags,
};

use crate::MAX_HEIGHT;
use crate::error::{ColaError, ColaResult};
use crate::state::StateMatrix;

/// Magic word identifying a COLA meta page.
pub const COLA_MAGIC: u32 = 0x011B_ED;

/// Block number of the meta page.
pub const META_BLOCK: BlockNumber = 0;

/// Smallest page size that can hold the meta payload.
pub const META_MIN_PAGE_SIZE: usize =
    PAGE_HEADER_SIZE + core::mem::size_of::<MetaPageData>() + PAGE_TRAILER_SIZE;

/// Payload stored in the meta page's contents area.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct MetaPageData {
    pub magic: u32,
    pub states: [[u16; 3]; MAX_HEIGHT],
}

/// Lay out a fresh meta page: META trailer flag, magic word, and a zeroed
/// matrix with every word tagged by its slot coordinates.
pub fn init_meta_page(page: &mut PageBuf) {
    page.init(PageFlags::META);
    let data = MetaPageData { magic: COLA_MAGIC, states: StateMatrix::new_tagged().to_words() };
    let bytes = bytemuck::bytes_of(&data);
    page.contents_mut()[..bytes.len()].copy_from_slice(bytes);
}

fn read_meta(page: &PageBuf) -> ColaResult<MetaPageData> {
    let len = core::mem::size_of::<MetaPageData>();
    let contents = page.contents();
    if contents.len() < len {
        return Err(ColaError::CorruptMeta);
    }
    let data: MetaPageData = bytemuck::pod_read_unaligned(&contents[..len]);
    if data.magic != COLA_MAGIC {
        return Err(ColaError::CorruptMeta);
    }
    Ok(data)
}

/// Snapshot the array-state matrix.
pub fn load_matrix(pool: &BufferPool) -> ColaResult<StateMatrix> {
    let page = pool.read_page(META_BLOCK)?;
    Ok(StateMatrix::from_words(read_meta(&page)?.states))
}

/// Checkpoint the matrix back to the meta page, preserving the magic word.
pub fn save_matrix(pool: &BufferPool, matrix: &StateMatrix) -> ColaResult<()> {
    let mut page = pool.read_page(META_BLOCK)?;
    let mut data = read_meta(&page)?;
    data.states = matrix.to_words();
    let bytes = bytemuck::bytes_of(&data);
    page.contents_mut()[..bytes.len()].copy_from_slice(bytes);
    pool.write_page(META_BLOCK, &page)?;
    Ok(())
}
