//! Minimal ELF64 reader: just enough to list DT_NEEDED entries so exec can
//! declare the dynamic libraries a binary will pull in.

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const DT_NEEDED: u64 = 1;
const DT_STRTAB: u64 = 5;

fn u16_at(b: &[u8], ofs: usize) -> Option<u16> {
    Some(u16::from_le_bytes(b.get(ofs..ofs + 2)?.try_into().ok()?))
}

fn u32_at(b: &[u8], ofs: usize) -> Option<u32> {
    Some(u32::from_le_bytes(b.get(ofs..ofs + 4)?.try_into().ok()?))
}

fn u64_at(b: &[u8], ofs: usize) -> Option<u64> {
    Some(u64::from_le_bytes(b.get(ofs..ofs + 8)?.try_into().ok()?))
}

/// Names of the libraries `path` declares as needed. Empty on anything that
/// is not a little-endian ELF64 (scripts, 32-bit, corrupt files): exec
/// analysis degrades gracefully rather than erroring.
pub fn needed_libs(path: &str) -> Vec<String> {
    needed_libs_inner(path).unwrap_or_default()
}

fn needed_libs_inner(path: &str) -> Option<Vec<String>> {
    let data = std::fs::read(path).ok()?;
    if data.get(..4)? != ELF_MAGIC || *data.get(4)? != ELFCLASS64 || *data.get(5)? != ELFDATA2LSB {
        return None;
    }
    let e_phoff = u64_at(&data, 0x20)? as usize;
    let e_phentsize = u16_at(&data, 0x36)? as usize;
    let e_phnum = u16_at(&data, 0x38)? as usize;

    // vaddr → file offset through the PT_LOAD segments
    let mut loads: Vec<(u64, u64, u64)> = Vec::new(); // (vaddr, offset, filesz)
    let mut dynamic: Option<(usize, usize)> = None; // (offset, size)
    for i in 0..e_phnum {
        let ph = e_phoff + i * e_phentsize;
        let p_type = u32_at(&data, ph)?;
        let p_offset = u64_at(&data, ph + 0x08)?;
        let p_vaddr = u64_at(&data, ph + 0x10)?;
        let p_filesz = u64_at(&data, ph + 0x20)?;
        match p_type {
            PT_LOAD => loads.push((p_vaddr, p_offset, p_filesz)),
            PT_DYNAMIC => dynamic = Some((p_offset as usize, p_filesz as usize)),
            _ => {}
        }
    }
    let (dyn_ofs, dyn_sz) = dynamic?;
    let to_offset = |vaddr: u64| -> Option<usize> {
        for &(va, of, sz) in &loads {
            if vaddr >= va && vaddr < va + sz {
                return Some((vaddr - va + of) as usize);
            }
        }
        None
    };

    let mut needed_ofs: Vec<u64> = Vec::new();
    let mut strtab_vaddr: Option<u64> = None;
    let mut pos = dyn_ofs;
    while pos + 16 <= dyn_ofs + dyn_sz {
        let d_tag = u64_at(&data, pos)?;
        let d_val = u64_at(&data, pos + 8)?;
        match d_tag {
            0 => break, // DT_NULL
            DT_NEEDED => needed_ofs.push(d_val),
            DT_STRTAB => strtab_vaddr = Some(d_val),
            _ => {}
        }
        pos += 16;
    }
    let strtab = to_offset(strtab_vaddr?)?;
    let mut res = Vec::new();
    for ofs in needed_ofs {
        let start = strtab + ofs as usize;
        let end = data[start..].iter().position(|&c| c == 0)? + start;
        if let Ok(name) = std::str::from_utf8(&data[start..end]) {
            res.push(name.to_string());
        }
    }
    Some(res)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_elf_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("script");
        std::fs::write(&p, b"#!/bin/sh\necho hi\n").unwrap();
        assert!(needed_libs(p.to_str().unwrap()).is_empty());
        assert!(needed_libs("/definitely/not/there").is_empty());
    }

    #[test]
    fn real_binary_lists_libc() {
        // any dynamically linked system binary needs libc
        for cand in ["/bin/ls", "/usr/bin/ls", "/bin/cat"] {
            if std::path::Path::new(cand).exists() {
                let libs = needed_libs(cand);
                if !libs.is_empty() {
                    assert!(
                        libs.iter().any(|l| l.starts_with("libc.so")),
                        "{cand}: {libs:?}"
                    );
                    return;
                }
            }
        }
        // static-only environment: nothing to assert
    }
}
