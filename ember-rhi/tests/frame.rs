use ember_rhi::{
    Attachment, AttachmentLoad, AttachmentStore, BufferDesc, ClearValue, CommandListType, Device, DeviceDesc,
    Headless, HeadlessProfile, Instance, ResourceState, SwapchainDesc, SDR_FORMAT,
};

fn device(profile: HeadlessProfile, frame_count: u32) -> Device<Headless> {
    ember_core::log::initialize_for_tests();
    Instance::<Headless>::with_profiles(vec![profile])
        .unwrap()
        .create_device(&DeviceDesc::default().with_frame_count(frame_count))
        .unwrap()
}

fn render_frames(profile: HeadlessProfile, frames: u64) -> Device<Headless> {
    let device = device(profile, 2);
    {
        let queue = device.create_command_queue(CommandListType::Graphics).unwrap();
        let fence = device.create_fence(0).unwrap();
        let allocators = (0..device.frame_count())
            .map(|_| device.create_command_allocator(CommandListType::Graphics).unwrap())
            .collect::<Vec<_>>();
        let mut list = device.create_command_list(&allocators[0]).unwrap();
        let mut swapchain = device.create_swapchain(&queue, &SwapchainDesc::new(64, 48, None)).unwrap();

        let pass = device
            .create_render_pass(
                &[Attachment::color(swapchain.format(), AttachmentLoad::Clear, AttachmentStore::Store)
                    .with_clear_value(ClearValue::Color([0.2, 0.3, 0.8, 1.0]))],
                None,
            )
            .unwrap();
        let mut frame_fences = vec![0u64; device.frame_count()];

        for _ in 0..frames {
            let frame = device.begin_frame();
            fence.wait(frame_fences[frame]).unwrap();

            list.reset(&allocators[frame]).unwrap();
            list.begin_recording(false).unwrap();
            {
                let frame_buffer = device
                    .create_frame_buffer(&pass, &[swapchain.current_back_buffer()], None)
                    .unwrap();
                list.begin_render_pass(&pass, &frame_buffer).unwrap();
                assert!(list.is_in_render_pass());
                list.end_render_pass().unwrap();
            }
            list.end_recording().unwrap();

            queue.execute(&[&list]).unwrap();
            frame_fences[frame] = queue.signal_next(&fence).unwrap();
            assert_eq!(
                device.resource_state(swapchain.current_back_buffer()).unwrap(),
                ResourceState::Present
            );
            swapchain.present(&queue).unwrap();
            device.end_frame();
        }

        device.wait_execution_gpu_commands(&queue, &fence).unwrap();
        assert_eq!(queue.raw().submission_count(), frames);
        assert_eq!(fence.completed_value().unwrap(), frames + 1);
        assert_eq!(device.live_view_count(), 0);
    }
    device
}

#[test]
fn renders_frames_with_native_render_passes() {
    let device = render_frames(HeadlessProfile::full(), 5);
    assert_eq!(device.live_texture_count(), 0);
    assert_eq!(device.live_buffer_count(), 0);
}

#[test]
fn renders_frames_without_native_render_passes() {
    let device = render_frames(HeadlessProfile::minimal(), 3);
    assert!(!device.is_supported_render_pass());
    assert_eq!(device.live_texture_count(), 0);
}

#[test]
fn uploaded_data_reaches_a_readback_buffer() {
    let device = device(HeadlessProfile::full(), 2);
    let queue = device.create_command_queue(CommandListType::Graphics).unwrap();
    let fence = device.create_fence(0).unwrap();
    let allocator = device.create_command_allocator(CommandListType::Graphics).unwrap();
    let mut list = device.create_command_list(&allocator).unwrap();

    let data: Vec<u8> = (0..64u8).collect();
    let gpu = device.create_buffer(&BufferDesc::new("gpu", 64)).unwrap();
    let readback = device.create_buffer(&BufferDesc::readback(64)).unwrap();

    list.begin_recording(false).unwrap();
    list.upload_buffer(gpu, &data).unwrap();
    list.copy_resource(readback, gpu).unwrap();
    list.end_recording().unwrap();
    queue.execute(&[&list]).unwrap();
    device.wait_execution_gpu_commands(&queue, &fence).unwrap();

    let mut out = vec![0u8; 64];
    device.read_buffer(readback, 0, &mut out).unwrap();
    assert_eq!(out, data);

    device.destroy_buffer(gpu).unwrap();
    device.destroy_buffer(readback).unwrap();
}

#[test]
fn resizing_between_frames_replaces_back_buffers() {
    let device = device(HeadlessProfile::full(), 2);
    let queue = device.create_command_queue(CommandListType::Graphics).unwrap();
    let mut swapchain = device.create_swapchain(&queue, &SwapchainDesc::new(32, 32, None)).unwrap();
    assert_eq!(swapchain.format(), SDR_FORMAT);
    let before = swapchain.current_back_buffer();

    assert!(swapchain.resize(128, 64).unwrap());
    let after = swapchain.current_back_buffer();
    assert_ne!(before, after);
    let desc = device.texture_desc(after).unwrap();
    assert_eq!((desc.width, desc.height), (128, 64));
    assert!(matches!(swapchain.resize(0, 64), Err(ember_rhi::RhiError::Surface(_))));
}
