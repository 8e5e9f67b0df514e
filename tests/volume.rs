use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};
use rsfs::device::{BlockDevice, MemDevice, MemDeviceError};
use rsfs::fs::geometry::CLUSTER_SIZE;
use rsfs::{FsError, Mode, Volume};
use std::collections::HashSet;

const CLUSTER: u64 = CLUSTER_SIZE as u64;

fn formatted() -> Volume<MemDevice> {
    let mut volume = Volume::init(MemDevice::with_mib(2)).unwrap();
    volume.format().unwrap();
    volume
}

fn write_file(volume: &mut Volume<impl BlockDevice>, name: &str, data: &[u8]) {
    let handle = volume.open(name, Mode::Write).unwrap();
    assert_eq!(volume.write(handle, data).unwrap(), data.len());
    volume.close(handle).unwrap();
}

fn read_file(volume: &mut Volume<impl BlockDevice>, name: &str, len: usize) -> Vec<u8> {
    let handle = volume.open(name, Mode::Read).unwrap();
    let mut buf = vec![0; len];
    assert_eq!(volume.read(handle, &mut buf).unwrap(), len);
    assert_eq!(volume.read(handle, &mut [0; 8]).unwrap(), 0);
    volume.close(handle).unwrap();
    buf
}

/// Every file's chain matches its size and no cluster is shared.
fn assert_chains_consistent(volume: &Volume<impl BlockDevice>) {
    let mut seen = HashSet::new();
    let files: Vec<(String, u32)> = volume
        .entries()
        .map(|(name, size)| (name.to_owned(), size))
        .collect();
    for (name, size) in files {
        let chain = volume.chain_of(&name).unwrap();
        assert_eq!(
            chain.len(),
            (size as usize).div_ceil(CLUSTER_SIZE),
            "chain length of {name:?}"
        );
        for cluster in chain {
            assert!(seen.insert(cluster), "cluster {cluster} used twice");
        }
    }
}

#[test]
fn test_scenario_two_cluster_file() {
    let mut volume = formatted();
    volume.create("a.txt").unwrap();
    write_file(&mut volume, "a.txt", &[0x41; 5000]);
    let data = read_file(&mut volume, "a.txt", 5000);
    assert!(data.iter().all(|b| *b == 0x41));
    assert_eq!(volume.chain_of("a.txt").unwrap().len(), 2);
}

#[test]
fn test_round_trip_random_lengths() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut volume = formatted();
    for len in [0, 1, 511, 512, 4095, 4096, 4097, 8192, 12_345, 40_000] {
        let mut data = vec![0; len];
        rng.fill_bytes(&mut data);
        write_file(&mut volume, "rt", &data);
        assert_eq!(read_file(&mut volume, "rt", len), data);
    }
}

#[test]
fn test_boundary_writes() {
    let mut volume = formatted();
    write_file(&mut volume, "under", &vec![1; CLUSTER_SIZE - 1]);
    assert_eq!(volume.chain_of("under").unwrap().len(), 1);

    let handle = volume.open("over", Mode::Write).unwrap();
    volume.write(handle, &vec![2; CLUSTER_SIZE]).unwrap();
    volume.write(handle, &[3]).unwrap();
    volume.close(handle).unwrap();
    assert_eq!(volume.chain_of("over").unwrap().len(), 2);
}

#[test]
fn test_space_accounting() {
    let mut volume = formatted();
    let geometry = *volume.geometry();
    let initial = volume.free_space().unwrap();
    assert_eq!(
        initial,
        (geometry.total_clusters() as u64 - geometry.first_data_cluster() as u64) * CLUSTER
    );
    for k in 1..=4u64 {
        let name = format!("k{k}");
        let before = volume.free_space().unwrap();
        write_file(&mut volume, &name, &vec![0xEE; (k * CLUSTER) as usize]);
        assert_eq!(volume.free_space().unwrap(), before - k * CLUSTER);
    }
}

#[test]
fn test_remove_then_create_is_empty_and_disjoint() {
    let mut volume = formatted();
    write_file(&mut volume, "x", &vec![9; 3 * CLUSTER_SIZE]);
    write_file(&mut volume, "other", &[1; 10]);
    let old_chain: HashSet<u16> = volume.chain_of("x").unwrap().into_iter().collect();
    volume.remove("x").unwrap();
    volume.create("x").unwrap();
    assert!(volume.entries().any(|entry| entry == ("x", 0)));
    let new_chain = volume.chain_of("x").unwrap();
    assert!(new_chain.iter().all(|cluster| !old_chain.contains(cluster)));
    assert_chains_consistent(&volume);
}

#[test]
fn test_random_operations_keep_chains_consistent() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut volume = formatted();
    let names = ["a", "b", "c", "d", "e", "f"];
    for _ in 0..200 {
        let name = names[rng.gen_range(0..names.len())];
        match rng.gen_range(0..3) {
            0 => {
                let len = rng.gen_range(0..3 * CLUSTER_SIZE);
                let handle = volume.open(name, Mode::Write).unwrap();
                for _ in 0..rng.gen_range(1..4) {
                    volume.write(handle, &vec![7; len / 3]).unwrap();
                }
                volume.close(handle).unwrap();
            }
            1 => match volume.remove(name) {
                Ok(()) | Err(FsError::NotFound(_)) => {}
                Err(err) => panic!("unexpected error: {err}"),
            },
            _ => match volume.create(name) {
                Ok(()) | Err(FsError::DuplicateName(_)) => {}
                Err(err) => panic!("unexpected error: {err}"),
            },
        }
        assert_chains_consistent(&volume);
    }
    let used: u64 = volume
        .entries()
        .map(|(_, size)| (size as u64).div_ceil(CLUSTER) * CLUSTER)
        .sum();
    let geometry = *volume.geometry();
    assert_eq!(
        volume.free_space().unwrap() + used,
        (geometry.total_clusters() as u64 - geometry.first_data_cluster() as u64) * CLUSTER
    );
}

#[test]
fn test_contents_survive_remount() {
    let mut volume = formatted();
    let data: Vec<u8> = (0..20_000).map(|i| (i % 256) as u8).collect();
    write_file(&mut volume, "persist", &data);
    let handle = volume.open("persist", Mode::Read).unwrap();

    // the open read handle doesn't survive, the file does
    let mut volume = Volume::init(volume.into_device()).unwrap();
    assert!(volume.is_formatted());
    assert!(matches!(
        volume.read(handle, &mut [0; 4]),
        Err(FsError::InvalidHandle(_))
    ));
    assert_eq!(read_file(&mut volume, "persist", data.len()), data);
    assert_chains_consistent(&volume);
}

#[test]
fn test_directory_full() {
    let mut volume = formatted();
    for i in 0..128 {
        volume.create(&format!("file{i}")).unwrap();
    }
    assert!(matches!(volume.create("late"), Err(FsError::DirectoryFull)));
    assert!(matches!(
        volume.open("late", Mode::Write),
        Err(FsError::DirectoryFull)
    ));
}

/// Fails every sector write after the first `budget` ones.
struct FlakyDevice {
    inner: MemDevice,
    budget: usize,
}

impl BlockDevice for FlakyDevice {
    type IoError = MemDeviceError;

    fn sector_count(&self) -> u64 {
        self.inner.sector_count()
    }

    fn read_sector(&mut self, sector: u64, buf: &mut [u8]) -> Result<(), Self::IoError> {
        self.inner.read_sector(sector, buf)
    }

    fn write_sector(&mut self, sector: u64, buf: &[u8]) -> Result<(), Self::IoError> {
        if self.budget == 0 {
            return Err(MemDeviceError::OutOfRange {
                sector,
                count: self.inner.sector_count(),
            });
        }
        self.budget -= 1;
        self.inner.write_sector(sector, buf)
    }
}

#[test]
fn test_device_error_is_reported() {
    let mut volume = formatted();
    write_file(&mut volume, "before", b"stable");
    let device = FlakyDevice {
        inner: volume.into_device(),
        budget: 0,
    };
    let mut volume = Volume::init(device).unwrap();
    assert!(matches!(
        volume.create("after"),
        Err(FsError::DeviceIo { sector: 0, .. })
    ));
    assert!(matches!(volume.format(), Err(FsError::DeviceIo { .. })));
}

#[test]
fn test_interrupted_format_can_be_redone() {
    // enough for the table cluster, the directory write fails
    let device = FlakyDevice {
        inner: MemDevice::with_mib(2),
        budget: 8,
    };
    let mut volume = Volume::init(device).unwrap();
    assert!(matches!(volume.format(), Err(FsError::DeviceIo { sector: 8, .. })));

    let mut device = volume.into_device();
    assert_eq!(&device.inner.as_bytes()[..4], &[3, 0, 4, 0]);
    device.budget = usize::MAX;
    let mut volume = Volume::init(device).unwrap();
    assert!(!volume.is_formatted());
    assert!(matches!(volume.create("a"), Err(FsError::NotFormatted)));
    volume.format().unwrap();
    volume.create("a").unwrap();

    let volume = Volume::init(volume.into_device()).unwrap();
    assert!(volume.is_formatted());
    assert_eq!(volume.list().unwrap(), "a\t\t0 bytes\n");
}

#[test]
fn test_unformatted_image_with_garbage() {
    let mut device = MemDevice::with_mib(2);
    device.write_sector(0, &[0xFF; 512]).unwrap();
    let mut volume = Volume::init(&mut device).unwrap();
    assert!(!volume.is_formatted());
    assert!(matches!(volume.list(), Err(FsError::NotFormatted)));
    volume.format().unwrap();
    assert_eq!(volume.list().unwrap(), "");
}
