mod common;

use common::TestDevice;
use kiln::traits::{CommandList, Device};
use kiln::types::*;
use kiln::Format;
use serial_test::serial;

#[test]
#[serial]
fn test_write_texture_and_read_back_through_staging() {
    let c_dim = 4u32;
    let Some(device) = TestDevice::acquire("test_write_texture_and_read_back_through_staging")
    else {
        return;
    };

    let texture = device
        .create_texture(TextureDesc {
            debug_name: "upload target".into(),
            width: c_dim,
            height: c_dim,
            format: Format::Rgba8Unorm,
            ..Default::default()
        })
        .unwrap();
    let staging = device
        .create_texture(TextureDesc {
            debug_name: "readback".into(),
            width: c_dim,
            height: c_dim,
            format: Format::Rgba8Unorm,
            cpu_access: CpuAccessMode::Read,
            ..Default::default()
        })
        .unwrap();

    let row_pitch = c_dim as u64 * 4;
    let data: Vec<u8> = (0..c_dim * c_dim * 4).map(|i| (i % 255) as u8).collect();

    let mut list = device.create_command_list(Default::default()).unwrap();
    list.open().unwrap();
    list.write_texture(&texture, 0, 0, &data, row_pitch).unwrap();
    list.copy_texture(
        &staging,
        TextureSlice::default(),
        &texture,
        TextureSlice::default(),
    )
    .unwrap();
    list.close().unwrap();

    let res = device.execute_command_lists(&mut [list.as_mut()], QueueKind::Graphics);
    assert!(res.is_ok());
    assert!(device.wait_for_idle().unwrap());

    let (ptr, mapped_pitch) = device
        .map_staging_texture(&staging, 0, 0, CpuAccessMode::Read)
        .unwrap();
    for row in 0..c_dim as usize {
        let mapped_row = unsafe {
            std::slice::from_raw_parts(ptr.add(row * mapped_pitch as usize), row_pitch as usize)
        };
        let expected = &data[row * row_pitch as usize..(row + 1) * row_pitch as usize];
        assert_eq!(mapped_row, expected);
    }
    device.unmap_staging_texture(&staging).unwrap();
}
