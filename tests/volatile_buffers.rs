mod common;

use common::TestDevice;
use kiln::traits::{CommandList, Device};
use kiln::types::*;
use serial_test::serial;

fn volatile_desc(max_versions: u32) -> BufferDesc {
    BufferDesc {
        debug_name: "volatile constants".into(),
        byte_size: 256,
        usage: BufferUsage::CONSTANT,
        is_volatile: true,
        max_versions,
        ..Default::default()
    }
}

#[test]
#[serial]
fn test_volatile_buffer_validation() {
    let Some(device) = TestDevice::acquire("test_volatile_buffer_validation") else {
        return;
    };

    let res = device.create_buffer(volatile_desc(0));
    assert!(matches!(res, Err(kiln::GpuError::InvalidArgument(_))));

    let res = device.create_buffer(BufferDesc {
        usage: BufferUsage::empty(),
        ..volatile_desc(4)
    });
    assert!(matches!(res, Err(kiln::GpuError::InvalidArgument(_))));

    assert!(device.create_buffer(volatile_desc(4)).is_ok());
}

#[test]
#[serial]
fn test_volatile_writes_are_whole_buffer() {
    let Some(device) = TestDevice::acquire("test_volatile_writes_are_whole_buffer") else {
        return;
    };

    let buffer = device.create_buffer(volatile_desc(4)).unwrap();
    let mut list = device.create_command_list(Default::default()).unwrap();
    list.open().unwrap();

    let res = list.write_buffer(&buffer, &[0u8; 64], 16);
    assert!(matches!(res, Err(kiln::GpuError::InvalidArgument(_))));
    let res = list.write_buffer(&buffer, &[0u8; 512], 0);
    assert!(matches!(res, Err(kiln::GpuError::InvalidArgument(_))));
    assert!(list.write_buffer(&buffer, &[0u8; 256], 0).is_ok());

    list.close().unwrap();
    let res = device.execute_command_lists(&mut [list.as_mut()], QueueKind::Graphics);
    assert!(res.is_ok());
    assert!(device.wait_for_idle().unwrap());
}

#[test]
#[serial]
fn test_volatile_versions_run_out_without_retirement() {
    let Some(device) = TestDevice::acquire("test_volatile_versions_run_out_without_retirement")
    else {
        return;
    };

    let buffer = device.create_buffer(volatile_desc(2)).unwrap();
    let mut list = device.create_command_list(Default::default()).unwrap();
    list.open().unwrap();

    assert!(list.write_buffer(&buffer, &[1u8; 256], 0).is_ok());
    assert!(list.write_buffer(&buffer, &[2u8; 256], 0).is_ok());
    let res = list.write_buffer(&buffer, &[3u8; 256], 0);
    assert!(matches!(res, Err(kiln::GpuError::OutOfSlots(_))));

    list.close().unwrap();
    let res = device.execute_command_lists(&mut [list.as_mut()], QueueKind::Graphics);
    assert!(res.is_ok());
    assert!(device.wait_for_idle().unwrap());
}

#[test]
#[serial]
fn test_multiple_writes_in_one_list_release_every_version() {
    let Some(device) = TestDevice::acquire("test_multiple_writes_in_one_list_release_every_version")
    else {
        return;
    };

    let buffer = device.create_buffer(volatile_desc(2)).unwrap();

    // Claim both versions inside a single recording.
    let mut list = device.create_command_list(Default::default()).unwrap();
    list.open().unwrap();
    assert!(list.write_buffer(&buffer, &[1u8; 256], 0).is_ok());
    assert!(list.write_buffer(&buffer, &[2u8; 256], 0).is_ok());
    list.close().unwrap();
    let res = device.execute_command_lists(&mut [list.as_mut()], QueueKind::Graphics);
    assert!(res.is_ok());
    assert!(device.wait_for_idle().unwrap());
    device.run_garbage_collection();

    // Every claimed version must have been promoted at submission; a leaked
    // pending token would make one of these claims fail on an idle device.
    let mut list = device.create_command_list(Default::default()).unwrap();
    list.open().unwrap();
    assert!(list.write_buffer(&buffer, &[3u8; 256], 0).is_ok());
    assert!(list.write_buffer(&buffer, &[4u8; 256], 0).is_ok());
    list.close().unwrap();
    let res = device.execute_command_lists(&mut [list.as_mut()], QueueKind::Graphics);
    assert!(res.is_ok());
    assert!(device.wait_for_idle().unwrap());
}

#[test]
#[serial]
fn test_volatile_versions_recycle_after_completion() {
    let Some(device) = TestDevice::acquire("test_volatile_versions_recycle_after_completion")
    else {
        return;
    };

    let buffer = device.create_buffer(volatile_desc(2)).unwrap();
    // Twice as many submissions as versions; retirement between submissions
    // keeps the claim loop from running dry.
    for round in 0..4u8 {
        let mut list = device.create_command_list(Default::default()).unwrap();
        list.open().unwrap();
        assert!(list.write_buffer(&buffer, &[round; 256], 0).is_ok());
        list.close().unwrap();
        let res = device.execute_command_lists(&mut [list.as_mut()], QueueKind::Graphics);
        assert!(res.is_ok());
        assert!(device.wait_for_idle().unwrap());
        device.run_garbage_collection();
    }
}
