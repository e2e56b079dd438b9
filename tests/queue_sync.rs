mod common;

use common::TestDevice;
use kiln::traits::{CommandList, Device};
use kiln::types::QueueKind;
use serial_test::serial;

fn submit_empty_list(device: &TestDevice) -> u64 {
    let mut list = device.create_command_list(Default::default()).unwrap();
    list.open().unwrap();
    list.begin_marker("empty submission");
    list.end_marker();
    list.close().unwrap();
    device
        .execute_command_lists(&mut [list.as_mut()], QueueKind::Graphics)
        .unwrap()
}

#[test]
#[serial]
fn test_event_query_lifecycle() {
    let Some(device) = TestDevice::acquire("test_event_query_lifecycle") else {
        return;
    };

    let query = device.create_event_query().unwrap();
    // Unset queries poll false but wait trivially.
    assert!(!device.poll_event_query(&query).unwrap());
    assert!(device.wait_event_query(&query).unwrap());

    submit_empty_list(&device);
    device.set_event_query(&query, QueueKind::Graphics).unwrap();
    assert!(device.wait_event_query(&query).unwrap());
    assert!(device.poll_event_query(&query).unwrap());

    device.reset_event_query(&query).unwrap();
    assert!(!device.poll_event_query(&query).unwrap());
}

#[test]
#[serial]
fn test_same_queue_wait_is_rejected() {
    let Some(device) = TestDevice::acquire("test_same_queue_wait_is_rejected") else {
        return;
    };

    let id = submit_empty_list(&device);
    let res = device.queue_wait_for_command_list(QueueKind::Graphics, QueueKind::Graphics, id);
    assert!(matches!(res, Err(kiln::GpuError::Misuse(_))));
    assert!(device.wait_for_idle().unwrap());
}

#[test]
#[serial]
fn test_cross_kind_wait_succeeds_on_folded_queues() {
    let Some(device) = TestDevice::acquire("test_cross_kind_wait_succeeds_on_folded_queues")
    else {
        return;
    };

    // Different kinds are a valid wait even when the device folds them onto
    // one family; the wait is then a no-op because that family already
    // executes in submission order.
    let id = submit_empty_list(&device);
    device
        .queue_wait_for_command_list(QueueKind::Compute, QueueKind::Graphics, id)
        .unwrap();
    assert!(device.wait_for_idle().unwrap());
}

#[test]
#[serial]
fn test_submission_ids_advance() {
    let Some(device) = TestDevice::acquire("test_submission_ids_advance") else {
        return;
    };

    let first = submit_empty_list(&device);
    let second = submit_empty_list(&device);
    assert!(second > first);

    assert!(device.wait_for_idle().unwrap());
    device.run_garbage_collection();
    assert!(device.queue_last_finished_id(QueueKind::Graphics) >= second);
}
