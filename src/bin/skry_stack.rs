//
// libskry_r - astronomical image stacking
// Copyright (c) 2017 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//
//
// File description:
//   Command-line stacking of an image list.
//

use clap::Parser;
use skry::config::PipelineConfig;
use skry::defs::{ProcessingError, ProcessingPhase};
use skry::image::Image;
use skry::img_align::ImgAlignmentProc;
use skry::img_seq::ImageSequence;
use skry::quality::QualityEstimationProc;
use skry::ref_pt_align::RefPointAlignmentProc;
use skry::stacking::StackingProc;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;


#[derive(Parser, Debug)]
#[command(name = "skry_stack", version, about = "Aligns and stacks a sequence of astronomical images")]
struct Args {
    /// Input images (BMP, PNG, TIFF, JPEG), in sequence order
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Processing parameters (JSON); defaults are used for missing fields
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output file for the image stack; format follows the extension
    #[arg(short, long, default_value = "stack.tif")]
    output: PathBuf,

    /// Flat-field image to divide the stacked images by
    #[arg(long)]
    flatfield: Option<PathBuf>,

    /// Also save the composite of best-quality fragments to this file
    #[arg(long)]
    best_fragments: Option<PathBuf>
}


/// Runs all steps of a processing phase.
fn execute_processing_phase<P: ProcessingPhase>(name: &str, phase_processor: &mut P) -> Result<(), ProcessingError> {
    let tstart = Instant::now();
    let mut num_steps = 0;

    loop {
        match phase_processor.step() {
            Ok(()) => num_steps += 1,
            Err(ProcessingError::NoMoreSteps) => break,
            Err(err) => return Err(err)
        }
    }

    log::info!("{}: {} step(s) in {:.3} s", name, num_steps, tstart.elapsed().as_secs_f64());
    Ok(())
}


fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default()
    };

    let flatfield = match &args.flatfield {
        Some(path) => Some(Image::load(path)?),
        None => None
    };

    let tstart = Instant::now();
    let mut img_seq = ImageSequence::new_image_list(&args.files);

    // Each `...Proc` holds a mutable reference to the image sequence, so it needs its own scope;
    // the `...Data` it produces holds no references.

    let img_align_data = {
        let mut img_align = ImgAlignmentProc::init(&mut img_seq, config.alignment.clone())?;
        execute_processing_phase("image alignment", &mut img_align)?;
        img_align.get_data()?
    };

    let qual_est_data = {
        let mut qual_est = QualityEstimationProc::init(&mut img_seq,
                                                       &img_align_data,
                                                       config.quality.area_size,
                                                       config.quality.detail_scale)?;
        execute_processing_phase("quality estimation", &mut qual_est)?;
        qual_est.get_data()?
    };

    if let Some(path) = &args.best_fragments {
        qual_est_data.get_best_fragments_img().save(path)?;
        log::info!("saved best fragments to \"{}\"", path.display());
    }

    let ref_pt_align_data = {
        let mut ref_pt_align = RefPointAlignmentProc::init(&mut img_seq,
                                                           &img_align_data,
                                                           &qual_est_data,
                                                           config.ref_points.clone(),
                                                           config.ref_pt_alignment.clone())?;
        execute_processing_phase("reference point alignment", &mut ref_pt_align)?;
        ref_pt_align.get_data()?
    };

    log::info!("reference points: {}, valid positions: {}, rejected: {}",
               ref_pt_align_data.get_num_ref_points(),
               ref_pt_align_data.get_num_valid_positions(),
               ref_pt_align_data.get_num_rejected_positions());

    let mut stacking = StackingProc::init(&mut img_seq, &img_align_data, &ref_pt_align_data, flatfield.as_ref())?;
    execute_processing_phase("stacking", &mut stacking)?;

    stacking.get_image_stack()?.save(&args.output)?;
    log::info!("saved \"{}\"; total time {:.3} s", args.output.display(), tstart.elapsed().as_secs_f64());

    Ok(())
}


fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{}", err);
            ExitCode::FAILURE
        }
    }
}
