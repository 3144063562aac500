const CLUSTER: usize = 512;

const L2_ENTRIES: usize = CLUSTER / 8;

const COPIED: u64 = 1 << 63;

/// Build a qcow2 (version 3) image with the contents of `data`.
///
/// Clusters are 512 bytes. Clusters with only zeros are left
/// unallocated.
pub fn from_raw(data: &[u8]) -> Vec<u8> {
    let clusters = data.len().div_ceil(CLUSTER);
    let l2_tables = clusters.div_ceil(L2_ENTRIES).max(1);
    assert!(l2_tables <= L2_ENTRIES, "image too big");

    let l1_offset = CLUSTER;
    let l2_offset = 2 * CLUSTER;
    let mut next_data = l2_offset + l2_tables * CLUSTER;

    let mut image = vec![0u8; next_data];

    // Header.
    image[0..4].copy_from_slice(b"QFI\xfb");
    image[4..8].copy_from_slice(&3u32.to_be_bytes());
    image[20..24].copy_from_slice(&9u32.to_be_bytes());
    image[24..32].copy_from_slice(&(data.len() as u64).to_be_bytes());
    image[36..40].copy_from_slice(&(l2_tables as u32).to_be_bytes());
    image[40..48].copy_from_slice(&(l1_offset as u64).to_be_bytes());
    image[96..100].copy_from_slice(&4u32.to_be_bytes());
    image[100..104].copy_from_slice(&112u32.to_be_bytes());

    // L1 table.
    for table in 0..l2_tables {
        let entry = (l2_offset + table * CLUSTER) as u64 | COPIED;
        let pos = l1_offset + table * 8;
        image[pos..pos + 8].copy_from_slice(&entry.to_be_bytes());
    }

    // L2 tables and data clusters.
    for (index, chunk) in data.chunks(CLUSTER).enumerate() {
        if chunk.iter().all(|b| *b == 0) {
            continue;
        }

        let entry = next_data as u64 | COPIED;
        let pos = l2_offset + index * 8;
        image[pos..pos + 8].copy_from_slice(&entry.to_be_bytes());

        image.extend_from_slice(chunk);
        image.resize(next_data + CLUSTER, 0);
        next_data += CLUSTER;
    }

    image
}
