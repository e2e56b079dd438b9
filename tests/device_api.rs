mod common;

use common::TestDevice;
use kiln::traits::{CommandList, Device};
use kiln::types::*;
use kiln::Format;
use serial_test::serial;

#[test]
#[serial]
fn test_device_creation() {
    let Some(device) = TestDevice::acquire("test_device_creation") else {
        return;
    };
    assert_eq!(device.graphics_api(), GraphicsApi::Vulkan);
    assert!(device.wait_for_idle().unwrap());
    assert!(device.messages.errors().is_empty());
}

#[test]
#[serial]
fn test_buffer_map_roundtrip() {
    let c_buffer_size = 1280u64;
    let c_test_val = 8u8;
    let Some(device) = TestDevice::acquire("test_buffer_map_roundtrip") else {
        return;
    };

    let buffer = device
        .create_buffer(BufferDesc {
            debug_name: "roundtrip".into(),
            byte_size: c_buffer_size,
            cpu_access: CpuAccessMode::Write,
            ..Default::default()
        })
        .unwrap();

    let data = vec![c_test_val; c_buffer_size as usize];
    let ptr = device.map_buffer(&buffer, CpuAccessMode::Write).unwrap();
    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
    device.unmap_buffer(&buffer).unwrap();

    let ptr = device.map_buffer(&buffer, CpuAccessMode::Read).unwrap();
    let readback = unsafe { std::slice::from_raw_parts(ptr, c_buffer_size as usize) };
    for byte in readback {
        assert_eq!(*byte, c_test_val);
    }
    device.unmap_buffer(&buffer).unwrap();
}

#[test]
#[serial]
fn test_write_buffer_and_read_back() {
    let c_buffer_size = 1024u64;
    let Some(device) = TestDevice::acquire("test_write_buffer_and_read_back") else {
        return;
    };

    let gpu_buffer = device
        .create_buffer(BufferDesc {
            debug_name: "gpu".into(),
            byte_size: c_buffer_size,
            ..Default::default()
        })
        .unwrap();
    let staging = device
        .create_buffer(BufferDesc {
            debug_name: "staging".into(),
            byte_size: c_buffer_size,
            cpu_access: CpuAccessMode::Read,
            ..Default::default()
        })
        .unwrap();

    let data: Vec<u8> = (0..c_buffer_size).map(|i| (i % 251) as u8).collect();

    let mut list = device.create_command_list(Default::default()).unwrap();
    list.open().unwrap();
    list.write_buffer(&gpu_buffer, &data, 0).unwrap();
    list.copy_buffer(&staging, 0, &gpu_buffer, 0, c_buffer_size)
        .unwrap();
    list.close().unwrap();

    let res = device.execute_command_lists(&mut [list.as_mut()], QueueKind::Graphics);
    assert!(res.is_ok());
    assert!(device.wait_for_idle().unwrap());

    let ptr = device.map_buffer(&staging, CpuAccessMode::Read).unwrap();
    let readback = unsafe { std::slice::from_raw_parts(ptr, c_buffer_size as usize) };
    assert_eq!(readback, &data[..]);
    device.unmap_buffer(&staging).unwrap();
}

#[test]
#[serial]
fn test_texture_creation_and_clear() {
    let Some(device) = TestDevice::acquire("test_texture_creation_and_clear") else {
        return;
    };

    let texture = device
        .create_texture(TextureDesc {
            debug_name: "clear target".into(),
            width: 256,
            height: 256,
            format: Format::Rgba8Unorm,
            usage: TextureUsage::SHADER_RESOURCE | TextureUsage::RENDER_TARGET,
            initial_state: ResourceStates::SHADER_RESOURCE,
            keep_initial_state: true,
            ..Default::default()
        })
        .unwrap();

    let mut list = device.create_command_list(Default::default()).unwrap();
    list.open().unwrap();
    let res = list.clear_texture_float(
        &texture,
        TextureSubresourceSet::all(),
        Color::new(0.25, 0.5, 0.75, 1.0),
    );
    assert!(res.is_ok());
    list.close().unwrap();

    let res = device.execute_command_lists(&mut [list.as_mut()], QueueKind::Graphics);
    assert!(res.is_ok());
    assert!(device.wait_for_idle().unwrap());
    assert!(device.messages.errors().is_empty());
}

#[test]
#[serial]
fn test_open_list_cannot_be_submitted() {
    let Some(device) = TestDevice::acquire("test_open_list_cannot_be_submitted") else {
        return;
    };

    let mut list = device.create_command_list(Default::default()).unwrap();
    list.open().unwrap();
    let res = device.execute_command_lists(&mut [list.as_mut()], QueueKind::Graphics);
    assert!(matches!(res, Err(kiln::GpuError::Misuse(_))));
    list.close().unwrap();
}

#[test]
#[serial]
fn test_list_queue_must_match_submission_queue() {
    let Some(device) = TestDevice::acquire("test_list_queue_must_match_submission_queue") else {
        return;
    };

    let mut list = device
        .create_command_list(CommandListParameters {
            queue_kind: QueueKind::Compute,
            ..Default::default()
        })
        .unwrap();
    list.open().unwrap();
    list.close().unwrap();
    let res = device.execute_command_lists(&mut [list.as_mut()], QueueKind::Graphics);
    assert!(matches!(res, Err(kiln::GpuError::Misuse(_))));
}

#[test]
#[serial]
fn test_zero_sized_buffer_is_rejected() {
    let Some(device) = TestDevice::acquire("test_zero_sized_buffer_is_rejected") else {
        return;
    };

    let res = device.create_buffer(BufferDesc {
        debug_name: "empty".into(),
        byte_size: 0,
        ..Default::default()
    });
    assert!(matches!(res, Err(kiln::GpuError::InvalidArgument(_))));
}
