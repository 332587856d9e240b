mod common;

use common::synthetic_sequence::{jittered_sequence, JITTER};
use skry::config::PipelineConfig;
use skry::defs::{Point, ProcessingError, ProcessingPhase};
use skry::image::{Image, PixelFormat};
use skry::img_align::{AlignmentMethod, AnchorConfig, ImgAlignmentData, ImgAlignmentProc};
use skry::img_seq::ImageSequence;
use skry::quality::QualityEstimationProc;
use skry::ref_pt_align::{QualityCriterion, RefPointAlignmentProc, RefPtAlignmentConfig};
use skry::stacking::StackingProc;


fn run_to_completion<P: ProcessingPhase>(proc: &mut P) {
    loop {
        match proc.step() {
            Ok(()) => (),
            Err(ProcessingError::NoMoreSteps) => break,
            Err(err) => panic!("processing failed: {}", err)
        }
    }
}


fn test_config() -> PipelineConfig {
    PipelineConfig::from_json(r#"{
        "alignment": {
            "method": "anchors",
            "initial_anchors": [{ "x": 60, "y": 60 }],
            "block_radius": 12,
            "search_radius": 12
        },
        "quality": { "area_size": 30, "detail_scale": 2 },
        "ref_pt_alignment": {
            "quality_criterion": { "percentage_best": 50 },
            "ref_block_size": 16,
            "search_radius": 6,
            "spacing": 30
        },
        "ref_points": [
            { "x": 20, "y": 20 }, { "x": 55, "y": 20 }, { "x": 90, "y": 20 },
            { "x": 20, "y": 55 }, { "x": 55, "y": 55 }, { "x": 90, "y": 55 },
            { "x": 20, "y": 90 }, { "x": 55, "y": 90 }, { "x": 90, "y": 90 }
        ]
    }"#).unwrap()
}


/// Runs all processing phases; returns alignment data and the image stack.
fn stack_sequence(img_seq: &mut ImageSequence, config: &PipelineConfig, flatfield: Option<&Image>) -> (ImgAlignmentData, Image) {
    let img_align_data = {
        let mut proc = ImgAlignmentProc::init(img_seq, config.alignment.clone()).unwrap();
        run_to_completion(&mut proc);
        proc.get_data().unwrap()
    };

    let qual_data = {
        let mut proc = QualityEstimationProc::init(img_seq, &img_align_data, config.quality.area_size, config.quality.detail_scale).unwrap();
        run_to_completion(&mut proc);
        proc.get_data().unwrap()
    };

    let ref_pt_data = {
        let mut proc = RefPointAlignmentProc::init(img_seq, &img_align_data, &qual_data,
                                                   config.ref_points.clone(), config.ref_pt_alignment.clone()).unwrap();
        run_to_completion(&mut proc);
        proc.get_data().unwrap()
    };

    let stack = {
        let mut proc = StackingProc::init(img_seq, &img_align_data, &ref_pt_data, flatfield).unwrap();
        run_to_completion(&mut proc);
        proc.into_image_stack().unwrap()
    };

    (img_align_data, stack)
}


#[test]
fn jittered_sequence_stacks_onto_first_frame() {
    let frames = jittered_sequence(120, 120);
    let first = frames[0].clone();
    let mut img_seq = ImageSequence::new_in_memory(frames);

    let (align_data, stack) = stack_sequence(&mut img_seq, &test_config(), None);

    assert_eq!(&JITTER[..], align_data.get_image_ofs());

    let intersection = align_data.get_intersection();
    assert_eq!(Point{ x: 3, y: 2 }, intersection.get_pos());
    assert_eq!((intersection.width, intersection.height), (stack.get_width(), stack.get_height()));
    assert_eq!(PixelFormat::Mono32f, stack.get_pixel_format());

    let stack_pixels = stack.get_pixels::<f32>();
    assert!(stack_pixels.iter().all(|&v| (0.0..=1.0).contains(&v)));

    // Compare the area spanned by the reference points
    let first_pixels = first.get_pixels::<u8>();
    let mut sum_abs_diff = 0.0f64;
    let mut count = 0usize;
    for y in 20..=90u32 {
        for x in 20..=90u32 {
            let expected = first_pixels[((y as i32 + intersection.y) * 120 + x as i32 + intersection.x) as usize] as f64 / 255.0;
            sum_abs_diff += (stack_pixels[(y * intersection.width + x) as usize] as f64 - expected).abs();
            count += 1;
        }
    }

    let mean_abs_diff = sum_abs_diff / count as f64;
    assert!(mean_abs_diff < 0.02, "mean abs. difference: {}", mean_abs_diff);
}


#[test]
fn image_files_are_stacked_and_saved() {
    let dir = tempfile::tempdir().unwrap();

    let file_names: Vec<_> = jittered_sequence(120, 120).iter().enumerate().map(|(i, frame)| {
        let path = dir.path().join(format!("frame{:02}.png", i));
        frame.save(&path).unwrap();
        path
    }).collect();

    let mut img_seq = ImageSequence::new_image_list(&file_names);
    let config = PipelineConfig{
        alignment: AlignmentMethod::Anchors(AnchorConfig{
            initial_anchors: Some(vec![Point{ x: 60, y: 60 }]),
            block_radius: 12,
            search_radius: 12,
            ..AnchorConfig::default()
        }),
        ref_pt_alignment: RefPtAlignmentConfig{
            quality_criterion: QualityCriterion::NumberBest(3),
            ..test_config().ref_pt_alignment
        },
        ..test_config()
    };

    let flatfield = Image::from_pixels(120, 120, PixelFormat::Mono8, None, vec![200u8; 120 * 120]).unwrap();
    let (align_data, stack) = stack_sequence(&mut img_seq, &config, Some(&flatfield));

    let max_value = stack.get_pixels::<f32>().iter().copied().fold(0.0f32, f32::max);
    assert!((max_value - 1.0).abs() < 1.0e-5);

    let out_path = dir.path().join("stack.tif");
    stack.save(&out_path).unwrap();

    let reloaded = Image::load(&out_path).unwrap();
    let intersection = align_data.get_intersection();
    assert_eq!((intersection.width, intersection.height), (reloaded.get_width(), reloaded.get_height()));
    assert_eq!(PixelFormat::Mono16, reloaded.get_pixel_format());
}
