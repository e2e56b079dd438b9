mod common;

use common::TestDevice;
use kiln::traits::{CommandList, Device};
use kiln::types::QueueKind;
use serial_test::serial;

#[test]
#[serial]
fn gpu_timer() {
    let Some(device) = TestDevice::acquire("gpu_timer") else {
        return;
    };

    let query = device.create_timer_query().unwrap();
    // Nothing recorded yet, so the query reports instantly.
    assert!(!device.poll_timer_query(&query).unwrap());
    assert_eq!(device.get_timer_query_time(&query).unwrap(), 0.0);

    let mut list = device.create_command_list(Default::default()).unwrap();
    list.open().unwrap();
    list.begin_timer_query(&query).unwrap();
    list.begin_marker("timed span");
    list.end_marker();
    list.end_timer_query(&query).unwrap();
    list.close().unwrap();

    let res = device.execute_command_lists(&mut [list.as_mut()], QueueKind::Graphics);
    assert!(res.is_ok());
    assert!(device.wait_for_idle().unwrap());

    let elapsed = device.get_timer_query_time(&query).unwrap();
    assert!(elapsed >= 0.0);
    assert!(device.poll_timer_query(&query).unwrap());

    // After a reset the query is reusable from scratch.
    device.reset_timer_query(&query).unwrap();
    assert!(!device.poll_timer_query(&query).unwrap());
}
