use crate::mem::Vpn;
use marrowos_shared::mem::PAGE_SIZE;
use nom::bytes::complete::{tag, take};
use nom::combinator::map_opt;
use nom::number::complete::le_u16;
use nom::IResult;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const IMAGE_MAGIC: [u8; 4] = [0x7F, b'M', b'R', b'X'];

const SECTION_HEADER_SIZE: usize = core::mem::size_of::<RawSection>();
const SECTION_READ_ONLY: u32 = 1;

/// On-disk section record, directly after the file header.
#[derive(FromZeroes, FromBytes, AsBytes, Debug, Clone, Copy)]
#[repr(C)]
struct RawSection {
    first_vpn: u32,
    page_count: u32,
    flags: u32,
    offset: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ImageError {
    InvalidMagicNumber,
    TruncatedHeader,
    SectionOutOfRange,
}

/// One loadable section of an executable image.
#[derive(Debug)]
pub struct Section {
    first_vpn: Vpn,
    page_count: usize,
    read_only: bool,
    data: Vec<u8>,
}

impl Section {
    pub fn new(first_vpn: Vpn, page_count: usize, read_only: bool, data: Vec<u8>) -> Self {
        assert!(data.len() <= page_count * PAGE_SIZE);
        Self {
            first_vpn,
            page_count,
            read_only,
            data,
        }
    }

    pub fn first_vpn(&self) -> Vpn {
        self.first_vpn
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Copy page `local` of this section into a frame, zero-padding a short
    /// tail page.
    pub fn load_page(&self, local: usize, dst: &mut [u8]) {
        assert!(local < self.page_count);
        debug_assert_eq!(dst.len(), PAGE_SIZE);
        let start = (local * PAGE_SIZE).min(self.data.len());
        let end = ((local + 1) * PAGE_SIZE).min(self.data.len());
        let len = end - start;
        dst[..len].copy_from_slice(&self.data[start..end]);
        dst[len..].fill(0);
    }
}

/// A parsed executable image: the section map the lazy loader indexes.
#[derive(Debug)]
pub struct Image {
    sections: Vec<Section>,
}

fn header(input: &[u8]) -> IResult<&[u8], u16> {
    let (input, _) = tag(IMAGE_MAGIC)(input)?;
    le_u16(input)
}

fn section_header(input: &[u8]) -> IResult<&[u8], RawSection> {
    map_opt(take(SECTION_HEADER_SIZE), RawSection::read_from)(input)
}

impl Image {
    pub fn from_sections(sections: Vec<Section>) -> Self {
        Self { sections }
    }

    /// Parse an image file. Layout: magic, little-endian section count, one
    /// [`RawSection`] per section, then each section's page-aligned data at
    /// its recorded offset.
    pub fn parse(bytes: &[u8]) -> Result<Self, ImageError> {
        let (mut rest, count) = header(bytes).map_err(|_| {
            if bytes.len() < IMAGE_MAGIC.len() + 2 {
                ImageError::TruncatedHeader
            } else {
                ImageError::InvalidMagicNumber
            }
        })?;
        let mut raw_sections = Vec::with_capacity(count.into());
        for _ in 0..count {
            let (r, raw) = section_header(rest).map_err(|_| ImageError::TruncatedHeader)?;
            rest = r;
            raw_sections.push(raw);
        }
        let mut sections = Vec::with_capacity(raw_sections.len());
        for raw in &raw_sections {
            let offset = raw.offset as usize;
            let len = raw.page_count as usize * PAGE_SIZE;
            let data = bytes
                .get(offset..offset + len)
                .ok_or(ImageError::SectionOutOfRange)?;
            sections.push(Section::new(
                raw.first_vpn as usize,
                raw.page_count as usize,
                raw.flags & SECTION_READ_ONLY != 0,
                data.to_vec(),
            ));
        }
        Ok(Self { sections })
    }

    /// Serialize back to the on-disk layout, padding each section's data to
    /// whole pages.
    pub fn to_bytes(&self) -> Vec<u8> {
        let header_len = IMAGE_MAGIC.len() + 2 + self.sections.len() * SECTION_HEADER_SIZE;
        let mut out = Vec::new();
        out.extend_from_slice(&IMAGE_MAGIC);
        out.extend_from_slice(
            &u16::try_from(self.sections.len())
                .expect("too many sections for image format")
                .to_le_bytes(),
        );
        let mut offset = header_len;
        for section in &self.sections {
            let raw = RawSection {
                first_vpn: section.first_vpn as u32,
                page_count: section.page_count as u32,
                flags: if section.read_only { SECTION_READ_ONLY } else { 0 },
                offset: offset as u32,
            };
            out.extend_from_slice(raw.as_bytes());
            offset += section.page_count * PAGE_SIZE;
        }
        for section in &self.sections {
            out.extend_from_slice(&section.data);
            out.resize(out.len() + section.page_count * PAGE_SIZE - section.data.len(), 0);
        }
        out
    }

    pub fn num_sections(&self) -> usize {
        self.sections.len()
    }

    pub fn section(&self, index: usize) -> &Section {
        &self.sections[index]
    }

    /// Virtual pages spanned by the sections (sections start at vpn 0 in
    /// well-formed images; gaps fault as zero-filled pages).
    pub fn num_pages(&self) -> usize {
        self.sections
            .iter()
            .map(|s| s.first_vpn + s.page_count)
            .max()
            .unwrap_or(0)
    }
}
