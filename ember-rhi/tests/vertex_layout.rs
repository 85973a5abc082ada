use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use ember_rhi::headless::HeadlessCommand;
use ember_rhi::{BufferDesc, CommandListType, DeviceDesc, Headless, Instance, PixelFormat, VertexLayout};

#[derive(Clone, Copy, Pod, Zeroable, VertexLayout)]
#[repr(C)]
struct MeshVertex {
    position: [f32; 3],
    normal: [f32; 3],
    #[vertex(semantic = "TEXCOORD")]
    uv: [f32; 2],
    color: [u8; 4],
}

impl MeshVertex {
    fn new(position: Vec3, uv: Vec2) -> Self {
        Self {
            position: position.to_array(),
            normal: Vec3::Z.to_array(),
            uv: uv.to_array(),
            color: [255; 4],
        }
    }
}

#[test]
fn derived_layout_follows_field_order() {
    let layout = MeshVertex::vertex_layout();
    assert_eq!(layout.stride as usize, size_of::<MeshVertex>());

    let attributes: Vec<_> = layout
        .attributes
        .iter()
        .map(|attribute| (attribute.semantic.as_ref(), attribute.location, attribute.format, attribute.offset))
        .collect();
    assert_eq!(
        attributes,
        vec![
            ("POSITION", 0, PixelFormat::R32G32B32Float, 0),
            ("NORMAL", 1, PixelFormat::R32G32B32Float, 12),
            ("TEXCOORD", 2, PixelFormat::R32G32Float, 24),
            ("COLOR", 3, PixelFormat::R8G8B8A8Unorm, 32),
        ]
    );
}

#[test]
fn vertex_buffer_binds_with_the_derived_stride() {
    ember_core::log::initialize_for_tests();
    let device = Instance::<Headless>::new(&Default::default())
        .unwrap()
        .create_device(&DeviceDesc::default())
        .unwrap();
    let allocator = device.create_command_allocator(CommandListType::Graphics).unwrap();
    let mut list = device.create_command_list(&allocator).unwrap();

    let vertices = [
        MeshVertex::new(Vec3::new(-1.0, -1.0, 0.0), Vec2::new(0.0, 1.0)),
        MeshVertex::new(Vec3::new(1.0, -1.0, 0.0), Vec2::new(1.0, 1.0)),
        MeshVertex::new(Vec3::new(0.0, 1.0, 0.0), Vec2::new(0.5, 0.0)),
    ];
    let stride = MeshVertex::vertex_layout().stride;
    let buffer = device
        .create_buffer(&BufferDesc::vertex_buffer(stride, vertices.len() as u32))
        .unwrap();

    list.begin_recording(false).unwrap();
    list.upload_buffer(buffer, bytemuck::cast_slice(&vertices)).unwrap();
    list.set_vertex_buffer(0, buffer).unwrap();
    list.end_recording().unwrap();

    let bound = list.raw().commands().iter().find_map(|command| match command {
        HeadlessCommand::SetVertexBuffers { first_slot, buffers } => Some((*first_slot, buffers.clone())),
        _ => None,
    });
    let (first_slot, buffers) = bound.unwrap();
    assert_eq!(first_slot, 0);
    assert_eq!(buffers.len(), 1);
    assert_eq!(buffers[0].2, stride);
}
