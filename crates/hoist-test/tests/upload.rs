//! GPU integration tests for the upload engine.
//!
//! These run against a real Vulkan device and are ignored by default;
//! run them with `cargo test -p hoist-test -- --ignored` on a host with
//! a GPU and validation layers installed.

use ash::vk;
use hoist_test::{pattern, UploadHarness};
use hoist_upload::{UploadError, UploaderConfig};

/// Shrink the staging buffers so a modest payload spans several chunks.
fn small_staging_config() -> UploaderConfig {
    UploaderConfig {
        budget_fraction: 0.01,
        ..UploaderConfig::default()
    }
}

#[test]
#[ignore = "requires a Vulkan device"]
fn buffer_upload_roundtrip_multiple_chunks() {
    let harness = UploadHarness::with_config(small_staging_config()).unwrap();

    // Five full chunks plus a short tail
    let capacity = harness.uploader().staging_capacity() as usize;
    let len = capacity * 5 + 7;
    let data = pattern(len, 3);

    let mut destination = harness.create_destination_buffer(len as u64).unwrap();

    let ticket = harness
        .uploader()
        .upload_to_buffer(data.clone(), destination.buffer)
        .unwrap();
    ticket.join().unwrap();

    let contents = harness.read_buffer(&destination).unwrap();
    assert_eq!(&contents[..], &data[..]);

    harness.free_buffer(&mut destination).unwrap();
}

#[test]
#[ignore = "requires a Vulkan device"]
fn second_upload_wins_after_join() {
    let harness = UploadHarness::new().unwrap();

    let len = 1 << 20;
    let first = pattern(len, 11);
    let second = pattern(len, 77);
    let mut destination = harness.create_destination_buffer(len as u64).unwrap();

    harness
        .uploader()
        .upload_to_buffer(first, destination.buffer)
        .unwrap()
        .join()
        .unwrap();
    harness
        .uploader()
        .upload_to_buffer(second.clone(), destination.buffer)
        .unwrap()
        .join()
        .unwrap();

    let contents = harness.read_buffer(&destination).unwrap();
    assert_eq!(&contents[..], &second[..]);

    harness.free_buffer(&mut destination).unwrap();
}

#[test]
#[ignore = "requires a Vulkan device"]
fn image_upload_pixels_and_final_layout() {
    let harness = UploadHarness::new().unwrap();

    // 300 rows at the default granularity of 150: two row-range chunks
    let (width, height) = (64_u32, 300_u32);
    let data = pattern((width * height) as usize, 29);

    let mut image = harness
        .create_destination_image(width, height, vk::Format::R8_UNORM)
        .unwrap();

    let ticket = harness
        .uploader()
        .upload_to_image(
            data.clone(),
            image.image,
            vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            1,
        )
        .unwrap();
    ticket.join().unwrap();

    // The readback barrier asserts the image ended up in the requested
    // layout; validation layers flag any mismatch.
    let contents = harness
        .read_image(&image, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, 1)
        .unwrap();
    assert_eq!(&contents[..], &data[..]);

    harness.free_image(&mut image).unwrap();
}

#[test]
#[ignore = "requires a Vulkan device"]
fn concurrent_uploads_to_disjoint_buffers() {
    let harness = UploadHarness::with_config(small_staging_config()).unwrap();

    let capacity = harness.uploader().staging_capacity() as usize;
    let len = capacity * 3 + 1;

    let sources: Vec<_> = (0..4).map(|i| pattern(len, i as u8 * 13 + 1)).collect();
    let mut destinations: Vec<_> = (0..4)
        .map(|_| harness.create_destination_buffer(len as u64).unwrap())
        .collect();

    // All four tasks in flight at once, against disjoint destinations
    let tickets: Vec<_> = sources
        .iter()
        .zip(&destinations)
        .map(|(data, dst)| {
            harness
                .uploader()
                .upload_to_buffer(data.clone(), dst.buffer)
                .unwrap()
        })
        .collect();
    for ticket in tickets {
        ticket.join().unwrap();
    }

    for (data, dst) in sources.iter().zip(&destinations) {
        let contents = harness.read_buffer(dst).unwrap();
        assert_eq!(&contents[..], &data[..]);
    }

    for destination in &mut destinations {
        harness.free_buffer(destination).unwrap();
    }
}

#[test]
#[ignore = "requires a Vulkan device"]
fn invalid_tasks_are_rejected_before_scheduling() {
    let harness = UploadHarness::new().unwrap();
    let mut destination = harness.create_destination_buffer(1024).unwrap();

    // Zero-length source span
    let empty: std::sync::Arc<[u8]> = Vec::new().into();
    let err = harness
        .uploader()
        .upload_to_buffer(empty, destination.buffer)
        .unwrap_err();
    assert!(matches!(err, UploadError::InvalidUpload(_)));

    // Null destination handle
    let err = harness
        .uploader()
        .upload_to_buffer(pattern(16, 1), vk::Buffer::null())
        .unwrap_err();
    assert!(matches!(err, UploadError::InvalidUpload(_)));

    // Pixel data not matching the extent
    let err = harness
        .uploader()
        .upload_to_image(
            pattern(100, 1),
            vk::Image::null(),
            vk::Extent3D {
                width: 16,
                height: 16,
                depth: 1,
            },
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            1,
        )
        .unwrap_err();
    assert!(matches!(err, UploadError::InvalidUpload(_)));

    harness.free_buffer(&mut destination).unwrap();
}
