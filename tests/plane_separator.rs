//! Plane separator behavior: axis splitting, strip assembly, caching.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sciio::axes::{Axis, AxisType, DatasetMetadata, ImageMetadata, Plane};
use sciio::filters::PlaneSeparator;
use sciio::io::FileHandle;
use sciio::{
    open, BufferedStream, Config, LocationRegistry, PixelType, Reader, SciioResult, TiffWriter,
    WriterConfig,
};

const WIDTH: u64 = 12;
const HEIGHT: u64 = 6;
const CHANNELS: u64 = 3;
const TIMEPOINTS: u64 = 2;

/// Writes an interleaved RGB dataset and reopens it. Pixel (x, y) of plane
/// t holds channels (v, v+1, v+2) with v = 3*(t*w*h + y*w + x).
fn rgb_parent(dir: &tempfile::TempDir) -> Box<dyn Reader> {
    let mut image = ImageMetadata::new(
        vec![
            Axis::new(AxisType::Channel, CHANNELS),
            Axis::new(AxisType::X, WIDTH),
            Axis::new(AxisType::Y, HEIGHT),
            Axis::new(AxisType::Time, TIMEPOINTS),
        ],
        3,
        PixelType::Uint8,
    );
    image.interleaved_count = 1;
    let image = Arc::new(image);
    let meta = DatasetMetadata {
        images: vec![image.clone()],
        ..DatasetMetadata::default()
    };

    let path = dir.path().join("rgb.tif");
    {
        let stream = BufferedStream::new(Box::new(FileHandle::open_rw(&path).unwrap()));
        let writer = TiffWriter::new(stream, meta, WriterConfig::default()).unwrap();
        let offsets = [0u64; 3];
        let lengths = [CHANNELS, WIDTH, HEIGHT];
        for t in 0..TIMEPOINTS {
            let bytes: Vec<u8> = (0..WIDTH * HEIGHT * CHANNELS)
                .map(|i| ((t * WIDTH * HEIGHT * CHANNELS + i) % 256) as u8)
                .collect();
            let plane = Plane::populate(image.clone(), bytes, &offsets, &lengths);
            writer.save_plane(0, t, &plane, &offsets, &lengths).unwrap();
        }
        writer.close().unwrap();
    }

    let registry = LocationRegistry::new();
    let id = path.to_string_lossy().into_owned();
    open(&registry, &id, &Config::default()).unwrap()
}

/// Delegating reader that counts how often the parent actually serves a
/// plane.
struct CountingReader {
    inner: Box<dyn Reader>,
    opens: Arc<AtomicUsize>,
}

impl Reader for CountingReader {
    fn metadata(&self) -> &DatasetMetadata {
        self.inner.metadata()
    }

    fn plane_count(&self, image_index: usize) -> SciioResult<u64> {
        self.inner.plane_count(image_index)
    }

    fn open_plane(
        &mut self,
        image_index: usize,
        plane_index: u64,
        offsets: &[u64],
        lengths: &[u64],
        config: &Config,
    ) -> SciioResult<Plane> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.inner
            .open_plane(image_index, plane_index, offsets, lengths, config)
    }

    fn open_thumb_plane(&mut self, image_index: usize, plane_index: u64) -> SciioResult<Plane> {
        self.inner.open_thumb_plane(image_index, plane_index)
    }

    fn close(&mut self) -> SciioResult<()> {
        self.inner.close()
    }
}

#[test]
fn derived_metadata_moves_channel_between_planes() {
    let dir = tempfile::tempdir().unwrap();
    let separator = PlaneSeparator::new(rgb_parent(&dir), vec![AxisType::Channel]).unwrap();

    assert_eq!(separator.offset(), 1);
    assert_eq!(separator.separated_axes(), &[AxisType::Channel]);

    let meta = separator.metadata().get(0).unwrap();
    assert_eq!(meta.planar_count, 2);
    assert_eq!(meta.axes_planar()[0].kind, AxisType::X);
    assert_eq!(meta.axes_planar()[1].kind, AxisType::Y);
    // split axes lead the non-planar tail
    assert_eq!(meta.axes_non_planar()[0].kind, AxisType::Channel);
    assert_eq!(meta.axes_non_planar()[1].kind, AxisType::Time);
    assert_eq!(meta.plane_count(), CHANNELS * TIMEPOINTS);
    assert_eq!(meta.interleaved_count, 0);
}

#[test]
fn original_index_drops_separated_coordinates() {
    let dir = tempfile::tempdir().unwrap();
    let separator = PlaneSeparator::new(rgb_parent(&dir), vec![AxisType::Channel]).unwrap();

    // virtual index = c + CHANNELS * t maps back to parent plane t
    for t in 0..TIMEPOINTS {
        for c in 0..CHANNELS {
            assert_eq!(separator.get_original_index(0, c + CHANNELS * t), t);
        }
    }
}

#[test]
fn separated_plane_extracts_one_channel() {
    // S5: virtual plane c=1 is the middle byte of every pixel triplet
    let dir = tempfile::tempdir().unwrap();
    let mut parent = rgb_parent(&dir);
    let reference = parent.open_full_plane(0, 0, &Config::default()).unwrap();
    let mut separator = PlaneSeparator::new(parent, vec![AxisType::Channel]).unwrap();

    let virtual_plane = separator.open_full_plane(0, 1, &Config::default()).unwrap();
    assert_eq!(virtual_plane.bytes().len() as u64, WIDTH * HEIGHT);
    for i in 0..(WIDTH * HEIGHT) as usize {
        assert_eq!(virtual_plane.bytes()[i], reference.bytes()[3 * i + 1]);
    }

    // every channel and timepoint projects correctly
    for t in 0..TIMEPOINTS {
        let parent_plane = {
            let dir2 = tempfile::tempdir().unwrap();
            let mut p = rgb_parent(&dir2);
            p.open_full_plane(0, t, &Config::default()).unwrap()
        };
        for c in 0..CHANNELS {
            let plane = separator
                .open_full_plane(0, c + CHANNELS * t, &Config::default())
                .unwrap();
            for i in 0..(WIDTH * HEIGHT) as usize {
                assert_eq!(
                    plane.bytes()[i],
                    parent_plane.bytes()[CHANNELS as usize * i + c as usize],
                    "mismatch at pixel {i}, c={c}, t={t}"
                );
            }
        }
    }
}

#[test]
fn no_separation_is_identity() {
    let dir = tempfile::tempdir().unwrap();
    let mut parent = rgb_parent(&dir);
    let expected_full = parent.open_full_plane(0, 1, &Config::default()).unwrap();
    let expected_sub = parent
        .open_plane(0, 1, &[0, 2, 1], &[CHANNELS, 5, 4], &Config::default())
        .unwrap();

    let mut separator = PlaneSeparator::new(parent, Vec::new()).unwrap();
    assert_eq!(separator.offset(), 0);
    assert_eq!(
        separator.metadata().get(0).unwrap().plane_count(),
        TIMEPOINTS
    );

    let full = separator.open_full_plane(0, 1, &Config::default()).unwrap();
    assert_eq!(full.bytes(), expected_full.bytes());

    let sub = separator
        .open_plane(0, 1, &[0, 2, 1], &[CHANNELS, 5, 4], &Config::default())
        .unwrap();
    assert_eq!(sub.bytes(), expected_sub.bytes());
}

#[test]
fn strip_wise_assembly_matches_single_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let mut whole = PlaneSeparator::new(rgb_parent(&dir), vec![AxisType::Channel]).unwrap();

    let dir2 = tempfile::tempdir().unwrap();
    let mut stripped = PlaneSeparator::new(rgb_parent(&dir2), vec![AxisType::Channel]).unwrap();
    // force floor(sqrt(height)) strips
    stripped.set_memory_budget(1);

    for index in 0..CHANNELS * TIMEPOINTS {
        let a = whole.open_full_plane(0, index, &Config::default()).unwrap();
        let b = stripped
            .open_full_plane(0, index, &Config::default())
            .unwrap();
        assert_eq!(a.bytes(), b.bytes(), "plane {index} diverged across strip counts");
    }
}

#[test]
fn cache_serves_repeat_requests_from_one_parent_read() {
    let dir = tempfile::tempdir().unwrap();
    let opens = Arc::new(AtomicUsize::new(0));
    let counting = CountingReader {
        inner: rgb_parent(&dir),
        opens: opens.clone(),
    };
    let mut separator =
        PlaneSeparator::new(Box::new(counting), vec![AxisType::Channel]).unwrap();

    let config = Config::default();
    separator.open_full_plane(0, 0, &config).unwrap();
    assert_eq!(opens.load(Ordering::SeqCst), 1);

    // identical request: cache hit
    separator.open_full_plane(0, 0, &config).unwrap();
    assert_eq!(opens.load(Ordering::SeqCst), 1);

    // sibling channel of the same parent plane: still the cached bytes
    separator.open_full_plane(0, 2, &config).unwrap();
    assert_eq!(opens.load(Ordering::SeqCst), 1);

    // different offsets invalidate
    separator
        .open_plane(0, 0, &[1, 0], &[WIDTH - 1, HEIGHT], &config)
        .unwrap();
    assert_eq!(opens.load(Ordering::SeqCst), 2);

    // different parent plane (other timepoint) misses
    separator.open_full_plane(0, CHANNELS, &config).unwrap();
    assert_eq!(opens.load(Ordering::SeqCst), 3);
}

#[test]
fn indexed_parents_bypass_separation() {
    // palette-based images delegate straight to the parent; expansion is a
    // downstream concern
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("palette.tif");
    let mut image = ImageMetadata::new(
        vec![
            Axis::new(AxisType::X, 8),
            Axis::new(AxisType::Y, 8),
            Axis::new(AxisType::Time, 2),
        ],
        2,
        PixelType::Uint8,
    );
    image.indexed = true;
    image.color_table = Some(vec![vec![0u16; 256]; 3]);
    let image = Arc::new(image);
    let meta = DatasetMetadata {
        images: vec![image.clone()],
        ..DatasetMetadata::default()
    };

    let bytes: Vec<u8> = (0..64u8).collect();
    {
        let stream = BufferedStream::new(Box::new(FileHandle::open_rw(&path).unwrap()));
        let writer = TiffWriter::new(stream, meta, WriterConfig::default()).unwrap();
        for t in 0..2 {
            let plane = Plane::populate(image.clone(), bytes.clone(), &[0, 0], &[8, 8]);
            writer.save_plane(0, t, &plane, &[0, 0], &[8, 8]).unwrap();
        }
        writer.close().unwrap();
    }

    let registry = LocationRegistry::new();
    let id = path.to_string_lossy().into_owned();
    let parent = open(&registry, &id, &Config::default()).unwrap();
    assert!(parent.metadata().get(0).unwrap().indexed);

    let mut separator = PlaneSeparator::new(parent, vec![AxisType::Channel]).unwrap();
    // a single-sample palette image has no planar channel to separate
    assert_eq!(separator.offset(), 0);
    let plane = separator.open_full_plane(0, 1, &Config::default()).unwrap();
    assert_eq!(plane.bytes(), &bytes[..]);
}

#[test]
fn separating_spatial_axes_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    assert!(PlaneSeparator::new(rgb_parent(&dir), vec![AxisType::Y]).is_err());
}

#[test]
fn open_through_config_stacks_the_filter() {
    let dir = tempfile::tempdir().unwrap();
    // build the file once via the writer
    rgb_parent(&dir).close().unwrap();

    let registry = LocationRegistry::new();
    let id = dir.path().join("rgb.tif").to_string_lossy().into_owned();
    let config = Config {
        plane_separator: Some(vec![AxisType::Channel]),
        ..Config::default()
    };
    let mut reader = open(&registry, &id, &config).unwrap();
    assert_eq!(reader.plane_count(0).unwrap(), CHANNELS * TIMEPOINTS);
    let plane = reader.open_full_plane(0, 0, &config).unwrap();
    assert_eq!(plane.bytes().len() as u64, WIDTH * HEIGHT);
}
